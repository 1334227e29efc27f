// SPDX-License-Identifier: MPL-2.0

//! Condition variables.
//!
//! A condvar binds to the mutex its first waiter brings along and
//! stays bound while waiters remain. The wait splits into a prologue
//! (atomically release the mutex and sleep) and an epilogue
//! (unconditionally reacquire), so a host signal landing between the
//! two leaves the protocol consistent: the epilogue simply runs again.
//!
//! Signals are not delivered synchronously. The signaler bumps the
//! pending counter in the arena and marks the bound mutex's lock word;
//! the holder's next unlock drains the pending signals, so the common
//! signal-then-unlock sequence costs one scheduler call in total.

use core::sync::atomic::{AtomicU32, Ordering};

use nucleus::arena::{Arena, ArenaCell};
use nucleus::clock::Nanos;
use nucleus::sync::wait_queue::{FlushKind, WaitStatus};
use nucleus::sync::{fastlock, Policy, WaitQueue};

use crate::clock::{self, ClockId};
use crate::context::{Context, CurrentContext};
use crate::mutex::{Mutex, ShadowMutex};
use crate::prelude::*;
use crate::process::{Kernel, Pid, Process};
use crate::registry::Handle;

pub(crate) const COND_MAGIC: u32 = 0x8686_0302;

/// Pending-counter sentinel meaning "flush everyone".
pub(crate) const PENDING_BROADCAST: usize = usize::MAX;

/// Shadow-side sentinel for "not bound to any mutex".
const NO_DAT: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CondAttr {
    pub clock: ClockId,
    pub pshared: bool,
}

impl Default for CondAttr {
    fn default() -> Self {
        CondAttr {
            clock: ClockId::Realtime,
            pshared: false,
        }
    }
}

pub struct Cond {
    magic: AtomicU32,
    handle: AtomicU32,
    synch: WaitQueue,
    pending: ArenaCell,
    attr: CondAttr,
    scope: Option<Pid>,
    bound: SpinLock<Option<Arc<Mutex>>>,
}

impl Cond {
    pub(crate) fn create(process: &Arc<Process>, attr: CondAttr) -> Result<Arc<Cond>> {
        let arena = process.arena_for(attr.pshared);
        let Some(pending) = arena.alloc_word() else {
            return_errno_with_message!(Errno::EAGAIN, "arena exhausted");
        };
        let cond = Arc::new(Cond {
            magic: AtomicU32::new(COND_MAGIC),
            handle: AtomicU32::new(0),
            synch: WaitQueue::new(Policy::Prio),
            pending,
            attr,
            scope: process.scope_for(attr.pshared),
            bound: SpinLock::new(None),
        });
        let handle = process.kernel().registry().enter_anon(cond.clone())?;
        cond.handle.store(handle.raw(), Ordering::Relaxed);
        process.condq.lock().push(cond.clone());
        Ok(cond)
    }

    pub(crate) fn handle(&self) -> Handle {
        Handle::from_raw(self.handle.load(Ordering::Relaxed))
    }

    fn is_alive(&self) -> bool {
        self.magic.load(Ordering::Acquire) == COND_MAGIC
    }

    /// Delivers signals deferred on this condvar: wakes up to the
    /// pending count, or flushes everyone after a broadcast. Runs
    /// from the bound mutex's unlock path.
    pub(crate) fn deliver_deferred(&self) -> bool {
        let pending = self.pending.word().swap(0, Ordering::AcqRel);
        if pending == 0 {
            return false;
        }
        if pending == PENDING_BROADCAST {
            return self.synch.wake_all() > 0;
        }
        let mut woke = false;
        for _ in 0..pending {
            if self.synch.wake_one().is_none() {
                break;
            }
            woke = true;
        }
        woke
    }

    pub(crate) fn force_destroy(self: &Arc<Cond>, kernel: &Arc<Kernel>) {
        self.magic.store(0, Ordering::Release);
        self.synch.flush(FlushKind::Destroy);
        *self.bound.lock() = None;
        let _ = kernel.registry().remove(self.handle());
    }
}

fn fetch(ctx: &Context<'_>, handle: Handle) -> Result<Arc<Cond>> {
    let cond = ctx.kernel.registry().fetch::<Cond>(handle)?;
    if !cond.is_alive() {
        return_errno!(Errno::EINVAL);
    }
    ctx.process.check_scope(cond.scope)?;
    Ok(cond)
}

/// First half of the wait: bind, release the mutex and sleep.
///
/// Returns `Ok` when signaled; `ETIMEDOUT`, `EINTR` or `EINVAL`
/// (destroyed) from the sleep. Validation failures happen before the
/// mutex is released.
pub fn wait_prologue(
    ctx: &Context<'_>,
    cond_handle: Handle,
    mutex_handle: Handle,
    deadline: Option<Nanos>,
) -> Result<()> {
    let cond = fetch(ctx, cond_handle)?;
    let mutex = crate::mutex::fetch(ctx, mutex_handle)?;

    if cond.attr.pshared != mutex.attr().pshared {
        return_errno_with_message!(Errno::EINVAL, "mixed sharing scopes");
    }
    let curr = ctx.thread.nucleus();
    if !mutex.synch().is_owner(mutex.word(), curr) {
        return_errno_with_message!(Errno::EPERM, "waiting without holding the mutex");
    }
    let timeout = match deadline {
        None => nucleus::clock::Timeout::Never,
        Some(ns) => clock::to_timeout(ctx.kernel, cond.attr.clock, ns),
    };

    // Publish ourselves before letting the mutex go so a broadcast
    // arriving right after the release finds us.
    let sleeper = cond.synch.prepare(0);
    {
        let mut bound = cond.bound.lock();
        match bound.as_ref() {
            Some(existing) if !Arc::ptr_eq(existing, &mutex) => {
                return_errno_with_message!(Errno::EINVAL, "condvar bound to another mutex");
            }
            Some(_) => {}
            None => {
                *bound = Some(mutex.clone());
                mutex.conds.lock().push(Arc::downgrade(&cond));
            }
        }
    }
    mutex.release_internal(curr);

    let wakeup = sleeper.wait(timeout);
    match wakeup.status {
        WaitStatus::Woken => Ok(()),
        WaitStatus::Timedout => return_errno!(Errno::ETIMEDOUT),
        WaitStatus::Interrupted => return_errno!(Errno::EINTR),
        WaitStatus::Destroyed => return_errno!(Errno::EINVAL),
    }
}

/// Second half of the wait: reacquire the mutex, unbinding the
/// condvar when the last waiter is through. Returns whether the
/// binding was dissolved. `EINTR` means the reacquisition itself was
/// interrupted and the caller must run the epilogue again.
pub fn wait_epilogue(
    ctx: &Context<'_>,
    cond_handle: Handle,
    mutex_handle: Handle,
) -> Result<bool> {
    let cond = fetch(ctx, cond_handle)?;
    let mutex = crate::mutex::fetch(ctx, mutex_handle)?;

    crate::mutex::acquire_unchecked(ctx, &mutex, nucleus::clock::Timeout::Never)?;

    let mut unbound = false;
    if cond.synch.count() == 0 {
        let mut bound = cond.bound.lock();
        if bound.as_ref().is_some_and(|b| Arc::ptr_eq(b, &mutex)) {
            *bound = None;
            mutex.conds.lock().retain(|weak| {
                weak.upgrade()
                    .is_some_and(|candidate| !Arc::ptr_eq(&candidate, &cond))
            });
            unbound = true;
        }
    }
    Ok(unbound)
}

fn post_signal(ctx: &Context<'_>, handle: Handle, broadcast: bool) -> Result<()> {
    let cond = fetch(ctx, handle)?;
    let bound = cond.bound.lock().clone();
    let Some(mutex) = bound else {
        // No binding means no waiters; the signal is a no-op.
        return Ok(());
    };
    bump_pending(&cond, broadcast);
    fastlock::set_spare(mutex.word(), fastlock::COND_SIGNAL);
    if !mutex.synch().is_held(mutex.word()) {
        // No holder whose unlock could piggyback the delivery.
        fastlock::clear_spare(mutex.word(), fastlock::COND_SIGNAL);
        cond.deliver_deferred();
    }
    Ok(())
}

fn bump_pending(cond: &Cond, broadcast: bool) {
    if broadcast {
        cond.pending.word().store(PENDING_BROADCAST, Ordering::Release);
    } else {
        let _ = cond
            .pending
            .word()
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |pending| {
                (pending != PENDING_BROADCAST).then_some(pending + 1)
            });
    }
}

pub fn signal(ctx: &Context<'_>, handle: Handle) -> Result<()> {
    post_signal(ctx, handle, false)
}

pub fn broadcast(ctx: &Context<'_>, handle: Handle) -> Result<()> {
    post_signal(ctx, handle, true)
}

pub fn destroy(ctx: &Context<'_>, handle: Handle) -> Result<()> {
    let cond = fetch(ctx, handle)?;
    if cond.synch.count() > 0 || cond.bound.lock().is_some() {
        return_errno_with_message!(Errno::EBUSY, "condvar in use");
    }
    cond.magic.store(0, Ordering::Release);
    ctx.kernel.registry().remove(handle)?;
    ctx.process
        .condq
        .lock()
        .retain(|candidate| !Arc::ptr_eq(candidate, &cond));
    Ok(())
}

/// User-side half of a condvar.
pub struct ShadowCond {
    magic: AtomicU32,
    handle: Handle,
    arena: Arena,
    pending_offset: u32,
    attr: CondAttr,
    /// Lock-word offset of the bound mutex, [`NO_DAT`] while unbound.
    /// Lets a signaler that holds the mutex defer entirely in user
    /// space.
    bound_dat: AtomicU32,
}

impl ShadowCond {
    pub fn init(attr: CondAttr) -> Result<ShadowCond> {
        let cond = crate::syscall::sys_cond_init(attr)?;
        Ok(ShadowCond {
            magic: AtomicU32::new(COND_MAGIC),
            handle: cond.handle(),
            arena: cond.pending.arena().clone(),
            pending_offset: cond.pending.offset(),
            attr,
            bound_dat: AtomicU32::new(NO_DAT),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn attr(&self) -> &CondAttr {
        &self.attr
    }

    fn check_magic(&self) -> Result<()> {
        if self.magic.load(Ordering::Acquire) != COND_MAGIC {
            return_errno!(Errno::EINVAL);
        }
        Ok(())
    }

    /// Waits for a signal, releasing and reacquiring `mutex` around
    /// the sleep. An interrupted wait still reacquires the mutex and
    /// surfaces `EINTR`.
    pub fn wait(&self, mutex: &ShadowMutex, deadline: Option<Nanos>) -> Result<()> {
        self.check_magic()?;
        let count = mutex.save_count();

        let first = crate::syscall::sys_cond_wait_prologue(self.handle, mutex.handle(), deadline);
        match first {
            Ok(()) => {}
            Err(err) if matches!(err.error(), Errno::ETIMEDOUT | Errno::EINTR) => {}
            // Validation failed before the mutex was released; there
            // is nothing to reacquire, and the binding cache must not
            // learn a mutex the condvar never bound to.
            Err(err) => return Err(err),
        }
        // The prologue bound us (or confirmed the binding); only now
        // may signalers use the lock-word offset for the user-space
        // deferral fast path.
        self.bound_dat.store(mutex.dat_offset(), Ordering::Release);

        loop {
            match crate::syscall::sys_cond_wait_epilogue(self.handle, mutex.handle()) {
                Ok(unbound) => {
                    if unbound {
                        self.bound_dat.store(NO_DAT, Ordering::Release);
                    }
                    break;
                }
                Err(err) if err.error() == Errno::EINTR => continue,
                Err(err) => return Err(err),
            }
        }
        mutex.restore_count(count);
        first
    }

    /// Wakes one waiter. While the caller holds the bound mutex this
    /// is pure user space: bump the pending counter and flag the lock
    /// word; the unlock delivers.
    pub fn signal(&self) -> Result<()> {
        self.post(false)
    }

    /// Wakes all waiters.
    pub fn broadcast(&self) -> Result<()> {
        self.post(true)
    }

    fn post(&self, broadcast: bool) -> Result<()> {
        self.check_magic()?;
        let cur = CurrentContext::get()?;
        let dat = self.bound_dat.load(Ordering::Acquire);
        if dat != NO_DAT {
            let word = self.arena.at(dat);
            let me = cur.thread().nucleus().handle();
            if fastlock::owner_of(word.load(Ordering::Relaxed)) == me {
                let pending = self.arena.at(self.pending_offset);
                if broadcast {
                    pending.store(PENDING_BROADCAST, Ordering::Release);
                } else {
                    let _ = pending.fetch_update(Ordering::AcqRel, Ordering::Relaxed, |p| {
                        (p != PENDING_BROADCAST).then_some(p + 1)
                    });
                }
                fastlock::set_spare(word, fastlock::COND_SIGNAL);
                return Ok(());
            }
        }
        if broadcast {
            crate::syscall::sys_cond_broadcast(self.handle)
        } else {
            crate::syscall::sys_cond_signal(self.handle)
        }
    }

    pub fn destroy(&self) -> Result<()> {
        self.check_magic()?;
        crate::syscall::sys_cond_destroy(self.handle)?;
        self.magic.store(0, Ordering::Release);
        Ok(())
    }
}
