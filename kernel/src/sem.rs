// SPDX-License-Identifier: MPL-2.0

//! Counting semaphores.
//!
//! The value lives in the arena and doubles as the waiter count: a
//! depleted semaphore with n sleepers reads -n. User space handles
//! the uncontended cases (decrement while positive, increment while
//! non-negative) with bare compare-and-sets; every transition across
//! zero goes through the kernel, which keeps the value and the wait
//! queue consistent under the semaphore lock.
//!
//! Named semaphores layer the registry and the per-process descriptor
//! table on top, with the object living until the last close after an
//! unlink.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use nucleus::arena::{Arena, ArenaCell};
use nucleus::clock::{Nanos, Timeout};
use nucleus::sync::wait_queue::{FlushKind, WaitStatus};
use nucleus::sync::{Policy, WaitQueue};

use crate::clock::{self, ClockId};
use crate::config::SEM_VALUE_MAX;
use crate::context::Context;
use crate::prelude::*;
use crate::process::{Descriptor, Kernel, Pid, Process};
use crate::registry::Handle;

pub(crate) const SEM_MAGIC: u32 = 0x8686_0304;
pub(crate) const NAMED_SEM_MAGIC: u32 = 0x8686_0305;

bitflags::bitflags! {
    pub struct SemFlags: u32 {
        /// Visible from any process.
        const PSHARED   = 0x001;
        /// FIFO wakeup order instead of priority order.
        const FIFO      = 0x002;
        /// Posts wake one waiter without banking the count.
        const PULSE     = 0x004;
        /// `getvalue` reports -n when n waiters are pending.
        const REPORT    = 0x008;
        /// Deleting a pended semaphore succeeds but warns the caller.
        const WARNDEL   = 0x010;
        /// Deleting a pended semaphore is refused.
        const NOBUSYDEL = 0x020;
        /// Timed waits run on the monotonic clock.
        const RAWCLOCK  = 0x040;
        /// Registered under a name.
        const NAMED     = 0x080;
    }
}

bitflags::bitflags! {
    /// `open` flags for named semaphores.
    pub struct OFlags: u32 {
        const CREAT = 0x1;
        const EXCL  = 0x2;
    }
}

pub struct Sem {
    magic: AtomicU32,
    handle: AtomicU32,
    synch: WaitQueue,
    value: ArenaCell,
    flags: SemFlags,
    name: String,
    /// Name link plus open descriptors.
    refs: SpinLock<u32>,
    scope: Option<Pid>,
    /// Serializes the kernel-side value/queue transitions.
    lock: SpinLock<()>,
}

fn value_of(word: &AtomicUsize) -> i64 {
    word.load(Ordering::Acquire) as isize as i64
}

/// Decrement iff positive; the user-space trywait.
fn try_dec(word: &AtomicUsize) -> bool {
    word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
        ((raw as isize) > 0).then(|| raw.wrapping_sub(1))
    })
    .is_ok()
}

impl Sem {
    pub(crate) fn create(
        process: &Arc<Process>,
        name: &str,
        flags: SemFlags,
        value: u32,
    ) -> Result<Arc<Sem>> {
        if flags.contains(SemFlags::PULSE) && value > 0 {
            return_errno_with_message!(Errno::EINVAL, "pulse semaphores start at zero");
        }
        if value as i64 > SEM_VALUE_MAX {
            return_errno!(Errno::EINVAL);
        }
        let pshared = flags.contains(SemFlags::PSHARED);
        let arena = process.arena_for(pshared);
        let Some(cell) = arena.alloc_word() else {
            return_errno_with_message!(Errno::EAGAIN, "arena exhausted");
        };
        cell.word().store(value as usize, Ordering::Release);
        let policy = if flags.contains(SemFlags::FIFO) {
            Policy::Fifo
        } else {
            Policy::Prio
        };
        let sem = Arc::new(Sem {
            magic: AtomicU32::new(SEM_MAGIC),
            handle: AtomicU32::new(0),
            synch: WaitQueue::new(policy),
            value: cell,
            flags,
            name: name.to_owned(),
            refs: SpinLock::new(if name.is_empty() { 1 } else { 2 }),
            scope: process.scope_for(pshared),
            lock: SpinLock::new(()),
        });
        let registry = process.kernel().registry();
        let handle = if name.is_empty() {
            registry.enter_anon(sem.clone())?
        } else {
            registry.enter_named(&format!("sem/{name}"), sem.clone())?
        };
        sem.handle.store(handle.raw(), Ordering::Relaxed);
        process.semq.lock().push(sem.clone());
        Ok(sem)
    }

    pub(crate) fn handle(&self) -> Handle {
        Handle::from_raw(self.handle.load(Ordering::Relaxed))
    }

    fn is_alive(&self) -> bool {
        self.magic.load(Ordering::Acquire) == SEM_MAGIC
    }

    fn clock(&self) -> ClockId {
        if self.flags.contains(SemFlags::RAWCLOCK) {
            ClockId::Monotonic
        } else {
            ClockId::Realtime
        }
    }

    fn destroy_inner(self: &Arc<Sem>, kernel: &Arc<Kernel>) {
        self.magic.store(0, Ordering::Release);
        self.synch.flush(FlushKind::Destroy);
        let _ = kernel.registry().remove(self.handle());
    }

    /// Drops one reference; the semaphore dies with the last one.
    pub(crate) fn unref(self: &Arc<Sem>, kernel: &Arc<Kernel>) {
        let mut refs = self.refs.lock();
        *refs = refs.saturating_sub(1);
        let gone = *refs == 0;
        drop(refs);
        if gone {
            self.destroy_inner(kernel);
        }
    }

    pub(crate) fn force_destroy(self: &Arc<Sem>, kernel: &Arc<Kernel>) {
        self.destroy_inner(kernel);
    }
}

fn fetch(ctx: &Context<'_>, handle: Handle) -> Result<Arc<Sem>> {
    let sem = ctx.kernel.registry().fetch::<Sem>(handle)?;
    if !sem.is_alive() {
        return_errno!(Errno::EINVAL);
    }
    ctx.process.check_scope(sem.scope)?;
    Ok(sem)
}

pub fn trywait(ctx: &Context<'_>, handle: Handle) -> Result<()> {
    let sem = fetch(ctx, handle)?;
    if try_dec(sem.value.word()) {
        Ok(())
    } else {
        return_errno!(Errno::EAGAIN)
    }
}

pub fn wait(ctx: &Context<'_>, handle: Handle, deadline: Option<Nanos>) -> Result<()> {
    let sem = fetch(ctx, handle)?;
    let word = sem.value.word();
    let guard = sem.lock.lock();
    // One decrement, whatever the outcome: a positive value banked a
    // post for us, a non-positive one counts us among the sleepers.
    // The single atomic op leaves no window against the user-space
    // post path, which refuses to touch a negative value.
    let prev = word.fetch_sub(1, Ordering::AcqRel) as isize;
    if prev > 0 {
        return Ok(());
    }
    let sleeper = sem.synch.prepare(0);
    drop(guard);

    let timeout = match deadline {
        None => Timeout::Never,
        Some(ns) => clock::to_timeout(ctx.kernel, sem.clock(), ns),
    };
    let wakeup = sleeper.wait(timeout);
    match wakeup.status {
        WaitStatus::Woken => Ok(()),
        status => {
            // The post that would have paired with us never came;
            // leave the waiter count.
            let _guard = sem.lock.lock();
            word.fetch_add(1, Ordering::AcqRel);
            match status {
                WaitStatus::Timedout => return_errno!(Errno::ETIMEDOUT),
                WaitStatus::Interrupted => return_errno!(Errno::EINTR),
                _ => return_errno!(Errno::EINVAL),
            }
        }
    }
}

pub fn post(ctx: &Context<'_>, handle: Handle) -> Result<()> {
    let sem = fetch(ctx, handle)?;
    let word = sem.value.word();
    let _guard = sem.lock.lock();
    if value_of(word) == SEM_VALUE_MAX {
        return_errno!(Errno::EINVAL);
    }
    let new = word.fetch_add(1, Ordering::AcqRel) as isize + 1;
    if new <= 0 {
        sem.synch.wake_one();
    } else if sem.flags.contains(SemFlags::PULSE) {
        word.store(0, Ordering::Release);
    }
    Ok(())
}

/// Wakes every waiter at once, flooring the value at zero. Each woken
/// waiter observes a successful post.
pub fn broadcast(ctx: &Context<'_>, handle: Handle) -> Result<()> {
    let sem = fetch(ctx, handle)?;
    let word = sem.value.word();
    let _guard = sem.lock.lock();
    if value_of(word) < 0 {
        word.store(0, Ordering::Release);
        sem.synch.wake_all();
    }
    Ok(())
}

pub fn getvalue(ctx: &Context<'_>, handle: Handle) -> Result<i64> {
    let sem = fetch(ctx, handle)?;
    let value = value_of(sem.value.word());
    if value < 0 && !sem.flags.contains(SemFlags::REPORT) {
        Ok(0)
    } else {
        Ok(value)
    }
}

/// Destroys an anonymous semaphore. Returns whether waiters were
/// flushed (only reported under `WARNDEL`).
pub fn destroy(ctx: &Context<'_>, handle: Handle) -> Result<bool> {
    let sem = fetch(ctx, handle)?;
    let pended = sem.synch.count() > 0;
    if pended && sem.flags.contains(SemFlags::NOBUSYDEL) {
        return_errno_with_message!(Errno::EBUSY, "semaphore has waiters");
    }
    if pended && sem.flags.contains(SemFlags::WARNDEL) {
        warn!("deleting semaphore {:?} with waiters", sem.name);
    }
    ctx.process
        .semq
        .lock()
        .retain(|candidate| !Arc::ptr_eq(candidate, &sem));
    sem.unref(ctx.kernel);
    Ok(pended && sem.flags.contains(SemFlags::WARNDEL))
}

/// One process's attachment to a named semaphore.
pub struct NamedSemDesc {
    name: String,
    sem: Arc<Sem>,
    shadow: Arc<ShadowSem>,
    opens: AtomicU32,
}

impl NamedSemDesc {
    pub(crate) fn release(&self, kernel: &Arc<Kernel>) {
        self.shadow.invalidate();
        self.sem.unref(kernel);
    }
}

/// Opens (or creates) a named semaphore. Repeated opens from the same
/// process return the same shadow.
pub fn open(
    ctx: &Context<'_>,
    name: &str,
    oflags: OFlags,
    value: u32,
    extra: SemFlags,
) -> Result<Arc<ShadowSem>> {
    let mut descs = ctx.process.descs.lock();
    for (_, desc) in descs.iter() {
        if let Descriptor::NamedSem(named) = desc {
            if named.name == name {
                if oflags.contains(OFlags::CREAT | OFlags::EXCL) {
                    return_errno!(Errno::EEXIST);
                }
                named.opens.fetch_add(1, Ordering::Relaxed);
                return Ok(named.shadow.clone());
            }
        }
    }
    let registered = format!("sem/{name}");
    let sem = match ctx.kernel.registry().bind(&registered) {
        Ok(handle) => {
            if oflags.contains(OFlags::CREAT | OFlags::EXCL) {
                return_errno!(Errno::EEXIST);
            }
            let sem = ctx.kernel.registry().fetch::<Sem>(handle)?;
            let mut refs = sem.refs.lock();
            *refs += 1;
            drop(refs);
            sem
        }
        Err(err) if err.error() == Errno::EAGAIN => {
            if !oflags.contains(OFlags::CREAT) {
                return_errno!(Errno::ENOENT);
            }
            Sem::create(
                ctx.process,
                name,
                extra | SemFlags::NAMED | SemFlags::PSHARED,
                value,
            )?
        }
        Err(err) => return Err(err),
    };
    let shadow = Arc::new(ShadowSem::for_sem(&sem, NAMED_SEM_MAGIC));
    let desc = NamedSemDesc {
        name: name.to_owned(),
        sem,
        shadow: shadow.clone(),
        opens: AtomicU32::new(1),
    };
    descs.install(Descriptor::NamedSem(desc))?;
    Ok(shadow)
}

/// Closes one open of a named semaphore.
pub fn close(ctx: &Context<'_>, name: &str) -> Result<()> {
    let mut descs = ctx.process.descs.lock();
    let mut target = None;
    for (fd, desc) in descs.iter() {
        if let Descriptor::NamedSem(named) = desc {
            if named.name == name {
                target = Some(*fd);
                break;
            }
        }
    }
    let Some(fd) = target else {
        return_errno!(Errno::EINVAL);
    };
    let last = {
        let Descriptor::NamedSem(named) = descs.get(fd)? else {
            return_errno!(Errno::EINVAL);
        };
        named.opens.fetch_sub(1, Ordering::Relaxed) == 1
    };
    if last {
        let Descriptor::NamedSem(named) = descs.remove(fd)? else {
            return_errno!(Errno::EINVAL);
        };
        drop(descs);
        named.release(ctx.kernel);
    }
    Ok(())
}

/// Detaches the name; the semaphore lives on until the last close.
pub fn unlink(ctx: &Context<'_>, name: &str) -> Result<()> {
    let registered = format!("sem/{name}");
    let handle = ctx.kernel.registry().unlink(&registered)?;
    let sem = ctx.kernel.registry().fetch::<Sem>(handle)?;
    sem.unref(ctx.kernel);
    Ok(())
}

/// User-side half of a semaphore.
#[derive(Debug)]
pub struct ShadowSem {
    magic: AtomicU32,
    handle: Handle,
    arena: Arena,
    value_offset: u32,
    flags: SemFlags,
}

impl ShadowSem {
    fn for_sem(sem: &Arc<Sem>, magic: u32) -> ShadowSem {
        ShadowSem {
            magic: AtomicU32::new(magic),
            handle: sem.handle(),
            arena: sem.value.arena().clone(),
            value_offset: sem.value.offset(),
            flags: sem.flags,
        }
    }

    /// Initializes an anonymous semaphore.
    pub fn init(flags: SemFlags, value: u32) -> Result<ShadowSem> {
        let sem = crate::syscall::sys_sem_init_np(flags, value)?;
        Ok(Self::for_sem(&sem, SEM_MAGIC))
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    fn word(&self) -> &AtomicUsize {
        self.arena.at(self.value_offset)
    }

    fn check_magic(&self, named: bool) -> Result<()> {
        let expected = if named { NAMED_SEM_MAGIC } else { SEM_MAGIC };
        if self.magic.load(Ordering::Acquire) != expected {
            return_errno!(Errno::EINVAL);
        }
        Ok(())
    }

    fn check_any_magic(&self) -> Result<()> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != SEM_MAGIC && magic != NAMED_SEM_MAGIC {
            return_errno!(Errno::EINVAL);
        }
        Ok(())
    }

    /// Marks the shadow stale once its last process-local open is
    /// gone.
    pub(crate) fn invalidate(&self) {
        self.magic.store(0, Ordering::Release);
    }

    pub fn trywait(&self) -> Result<()> {
        self.check_any_magic()?;
        if try_dec(self.word()) {
            Ok(())
        } else {
            return_errno!(Errno::EAGAIN)
        }
    }

    pub fn wait(&self) -> Result<()> {
        self.timedwait_inner(None)
    }

    pub fn timedwait(&self, deadline: Nanos) -> Result<()> {
        self.timedwait_inner(Some(deadline))
    }

    fn timedwait_inner(&self, deadline: Option<Nanos>) -> Result<()> {
        self.check_any_magic()?;
        if try_dec(self.word()) {
            return Ok(());
        }
        crate::syscall::sys_sem_timedwait(self.handle, deadline)
    }

    pub fn post(&self) -> Result<()> {
        self.check_any_magic()?;
        if !self.flags.contains(SemFlags::PULSE) {
            // Bank the post in user space while nobody is waiting.
            let fast = self.word().fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |raw| {
                    let value = raw as isize as i64;
                    (0..SEM_VALUE_MAX).contains(&value).then(|| raw.wrapping_add(1))
                },
            );
            if fast.is_ok() {
                return Ok(());
            }
            if value_of(self.word()) >= SEM_VALUE_MAX {
                return_errno!(Errno::EINVAL);
            }
        }
        crate::syscall::sys_sem_post(self.handle)
    }

    pub fn broadcast(&self) -> Result<()> {
        self.check_any_magic()?;
        crate::syscall::sys_sem_broadcast(self.handle)
    }

    pub fn getvalue(&self) -> Result<i64> {
        self.check_any_magic()?;
        let value = value_of(self.word());
        if value < 0 && !self.flags.contains(SemFlags::REPORT) {
            Ok(0)
        } else {
            Ok(value)
        }
    }

    /// Destroys an anonymous semaphore; fails on named ones.
    pub fn destroy(&self) -> Result<bool> {
        self.check_magic(false)?;
        let warned = crate::syscall::sys_sem_destroy(self.handle)?;
        self.magic.store(0, Ordering::Release);
        Ok(warned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Process;
    use crate::thread::{RtThread, SchedParam};

    fn setup() -> (Arc<Kernel>, Arc<Process>) {
        let kernel = Kernel::new();
        let process = Process::new(&kernel);
        RtThread::attach_current(&process, "sem-test", SchedParam::fifo(1)).unwrap();
        (kernel, process)
    }

    #[test]
    fn value_accounting_is_conserved() {
        let (_kernel, process) = setup();
        let sem = Arc::new(ShadowSem::init(SemFlags::empty(), 3).unwrap());

        // 3 initial + 2 posts = 4 trywait successes + 1 remaining.
        sem.post().unwrap();
        sem.post().unwrap();
        let mut taken = 0;
        while sem.trywait().is_ok() {
            taken += 1;
            if taken == 4 {
                break;
            }
        }
        assert_eq!(taken, 4);
        assert_eq!(sem.getvalue().unwrap(), 1);
        sem.trywait().unwrap();
        assert_eq!(sem.trywait().unwrap_err().error(), Errno::EAGAIN);
        let _ = process;
    }

    #[test]
    fn pulse_posts_do_not_bank() {
        let (_kernel, _process) = setup();
        assert_eq!(
            ShadowSem::init(SemFlags::PULSE, 1).unwrap_err().error(),
            Errno::EINVAL
        );
        let sem = ShadowSem::init(SemFlags::PULSE, 0).unwrap();
        // No waiter: the pulse evaporates.
        sem.post().unwrap();
        assert_eq!(sem.getvalue().unwrap(), 0);
        assert_eq!(sem.trywait().unwrap_err().error(), Errno::EAGAIN);
        sem.destroy().unwrap();
    }

    #[test]
    fn timed_wait_expires_on_a_depleted_sem() {
        let (_kernel, _process) = setup();
        let sem = ShadowSem::init(SemFlags::empty(), 0).unwrap();
        let deadline = nucleus::clock::now() + 10_000_000;
        assert_eq!(
            sem.timedwait(deadline).unwrap_err().error(),
            Errno::ETIMEDOUT
        );
        // The aborted wait left no trace in the count.
        assert_eq!(sem.getvalue().unwrap(), 0);
        sem.destroy().unwrap();
    }

    #[test]
    fn broadcast_floors_the_value_at_zero() {
        let (_kernel, process) = setup();
        let sem = Arc::new(ShadowSem::init(SemFlags::REPORT, 0).unwrap());
        let mut workers = Vec::new();
        for i in 0..3 {
            let s = sem.clone();
            workers.push(
                RtThread::spawn(&process, &format!("bcast-{i}"), SchedParam::fifo(2), move || {
                    s.wait().unwrap();
                })
                .unwrap(),
            );
        }
        let deadline = std::time::Instant::now() + core::time::Duration::from_secs(5);
        while sem.getvalue().unwrap() != -3 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::yield_now();
        }
        sem.broadcast().unwrap();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(sem.getvalue().unwrap(), 0);
        sem.destroy().unwrap();
    }
}
