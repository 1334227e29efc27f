// SPDX-License-Identifier: MPL-2.0

//! Fastlock mutexes.
//!
//! The lock word lives in the shared arena; uncontended lock and
//! unlock are a single compare-and-set in user space. The kernel half
//! handles contention: blocking on the owned queue with optional
//! priority inheritance, atomic ownership hand-off on release, and
//! draining condition signals deferred on the lock word before the
//! word is given up.
//!
//! Recursive and error-checking flavours are a user-space concern:
//! the kernel reports re-acquisition by the owner and the shadow maps
//! that to the type's semantics.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use nucleus::arena::{Arena, ArenaCell};
use nucleus::clock::Timeout;
use nucleus::sync::fastlock;
use nucleus::sync::wait_queue::{FlushKind, WaitStatus};
use nucleus::sync::OwnedQueue;
use nucleus::thread::{State, Thread};

use crate::cond::Cond;
use crate::context::{Context, CurrentContext};
use crate::prelude::*;
use crate::process::{Kernel, Pid, Process};
use crate::registry::Handle;

pub(crate) const MUTEX_MAGIC: u32 = 0x8686_0301;

/// Bit in the flag word adjacent to the fastlock.
pub(crate) const MUTEX_FLAG_ERRORCHECK: usize = 0x1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutexType {
    Normal,
    ErrorCheck,
    Recursive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutexProtocol {
    None,
    PriorityInherit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutexAttr {
    pub typ: MutexType,
    pub protocol: MutexProtocol,
    pub pshared: bool,
}

impl Default for MutexAttr {
    fn default() -> Self {
        MutexAttr {
            typ: MutexType::Normal,
            protocol: MutexProtocol::None,
            pshared: false,
        }
    }
}

impl MutexAttr {
    pub fn recursive() -> Self {
        MutexAttr {
            typ: MutexType::Recursive,
            ..Default::default()
        }
    }

    pub fn pi() -> Self {
        MutexAttr {
            protocol: MutexProtocol::PriorityInherit,
            ..Default::default()
        }
    }
}

pub struct Mutex {
    magic: AtomicU32,
    handle: AtomicU32,
    fastlock: ArenaCell,
    flags: ArenaCell,
    synch: OwnedQueue,
    attr: MutexAttr,
    scope: Option<Pid>,
    /// Condvars currently bound to this mutex. The mutex owns the
    /// list; condvars link in only while they have waiters.
    pub(crate) conds: SpinLock<Vec<Weak<Cond>>>,
}

impl Mutex {
    pub(crate) fn create(process: &Arc<Process>, attr: MutexAttr) -> Result<Arc<Mutex>> {
        let arena = process.arena_for(attr.pshared);
        let Some(fastlock) = arena.alloc_word() else {
            return_errno_with_message!(Errno::EAGAIN, "arena exhausted");
        };
        let Some(flags) = arena.alloc_word() else {
            return_errno_with_message!(Errno::EAGAIN, "arena exhausted");
        };
        if attr.typ == MutexType::ErrorCheck {
            flags.word().store(MUTEX_FLAG_ERRORCHECK, Ordering::Release);
        }
        let mutex = Arc::new(Mutex {
            magic: AtomicU32::new(MUTEX_MAGIC),
            handle: AtomicU32::new(0),
            fastlock,
            flags,
            synch: OwnedQueue::new(attr.protocol == MutexProtocol::PriorityInherit),
            attr,
            scope: process.scope_for(attr.pshared),
            conds: SpinLock::new(Vec::new()),
        });
        let handle = process.kernel().registry().enter_anon(mutex.clone())?;
        mutex.handle.store(handle.raw(), Ordering::Relaxed);
        process.mutexq.lock().push(mutex.clone());
        Ok(mutex)
    }

    pub(crate) fn handle(&self) -> Handle {
        Handle::from_raw(self.handle.load(Ordering::Relaxed))
    }

    pub(crate) fn word(&self) -> &AtomicUsize {
        self.fastlock.word()
    }

    pub(crate) fn attr(&self) -> &MutexAttr {
        &self.attr
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.magic.load(Ordering::Acquire) == MUTEX_MAGIC
    }

    pub(crate) fn scope(&self) -> Option<Pid> {
        self.scope
    }

    pub(crate) fn synch(&self) -> &OwnedQueue {
        &self.synch
    }

    pub(crate) fn dat_offset(&self) -> u32 {
        self.fastlock.offset()
    }

    pub(crate) fn flags_offset(&self) -> u32 {
        self.flags.offset()
    }

    /// Releases the lock on behalf of the current owner, draining
    /// condition signals deferred on the word first. The wakeup of
    /// the next owner happens atomically with the word hand-off.
    pub(crate) fn release_internal(self: &Arc<Mutex>, curr: &Arc<Thread>) {
        let word = self.word();
        if fastlock::clear_spare(word, fastlock::COND_SIGNAL) & fastlock::COND_SIGNAL != 0 {
            let bound = self.conds.lock().clone();
            for cond in bound.iter().filter_map(Weak::upgrade) {
                cond.deliver_deferred();
            }
        }
        self.synch.release(word);
        if curr.state().contains(State::WEAK) {
            curr.dec_resource_count();
        }
    }

    pub(crate) fn force_destroy(self: &Arc<Mutex>, kernel: &Arc<Kernel>) {
        self.magic.store(0, Ordering::Release);
        self.synch.flush(FlushKind::Destroy);
        let _ = kernel.registry().remove(self.handle());
    }
}

fn thread_resolver(kernel: &Arc<Kernel>) -> impl Fn(u32) -> Option<Arc<Thread>> + '_ {
    move |raw| {
        kernel
            .registry()
            .fetch::<crate::thread::RtThread>(Handle::from_raw(raw))
            .ok()
            .map(|thread| thread.nucleus().clone())
    }
}

pub(crate) fn fetch(ctx: &Context<'_>, handle: Handle) -> Result<Arc<Mutex>> {
    let mutex = ctx.kernel.registry().fetch::<Mutex>(handle)?;
    if !mutex.is_alive() {
        return_errno!(Errno::EINVAL);
    }
    ctx.process.check_scope(mutex.scope())?;
    Ok(mutex)
}

/// Probes whether a shadow may be (re)initialized over `handle`:
/// a live registration there means the caller is about to clobber a
/// valid mutex.
pub fn check_init(ctx: &Context<'_>, handle: Handle) -> Result<()> {
    if ctx.kernel.registry().fetch::<Mutex>(handle).is_ok() {
        return_errno_with_message!(Errno::EBUSY, "mutex already initialized");
    }
    Ok(())
}

fn finish_acquire(ctx: &Context<'_>, status: WaitStatus) -> Result<()> {
    match status {
        WaitStatus::Woken => {
            let nucleus = ctx.thread.nucleus();
            if nucleus.state().contains(State::WEAK) {
                nucleus.inc_resource_count();
            }
            Ok(())
        }
        WaitStatus::Interrupted => return_errno!(Errno::EINTR),
        WaitStatus::Timedout => return_errno!(Errno::ETIMEDOUT),
        WaitStatus::Destroyed => return_errno!(Errno::EINVAL),
    }
}

/// Kernel slow-path acquisition with the per-type re-lock policy
/// applied.
pub fn timedlock_break(ctx: &Context<'_>, handle: Handle, timeout: Timeout) -> Result<()> {
    let mutex = fetch(ctx, handle)?;
    let curr = ctx.thread.nucleus();
    if curr.handle() == 0 {
        return_errno_with_message!(Errno::EPERM, "caller has no fastlock handle");
    }
    if mutex.synch.is_owner(mutex.word(), curr) {
        match mutex.attr.typ {
            MutexType::Normal => {
                warn!(
                    "thread {} would deadlock on non-recursive mutex",
                    curr.name()
                );
                return_errno!(Errno::EDEADLK);
            }
            // Handled in user space; reaching here means a corrupt
            // shadow.
            MutexType::ErrorCheck | MutexType::Recursive => return_errno!(Errno::EBUSY),
        }
    }
    let resolve = thread_resolver(ctx.kernel);
    let status = mutex.synch.acquire(mutex.word(), timeout, &resolve);
    finish_acquire(ctx, status)
}

/// Unconditional re-acquisition, used by the condvar epilogue: the
/// caller is never the owner and type policy does not apply.
pub(crate) fn acquire_unchecked(
    ctx: &Context<'_>,
    mutex: &Arc<Mutex>,
    timeout: Timeout,
) -> Result<()> {
    let resolve = thread_resolver(ctx.kernel);
    let status = mutex.synch.acquire(mutex.word(), timeout, &resolve);
    finish_acquire(ctx, status)
}

/// Non-blocking kernel acquisition.
pub fn trylock(ctx: &Context<'_>, handle: Handle) -> Result<()> {
    let mutex = fetch(ctx, handle)?;
    let curr = ctx.thread.nucleus();
    if mutex.synch.is_owner(mutex.word(), curr) {
        return_errno!(Errno::EBUSY);
    }
    if !fastlock::try_acquire(mutex.word(), curr.handle()) {
        return_errno!(Errno::EBUSY);
    }
    if curr.state().contains(State::WEAK) {
        curr.inc_resource_count();
    }
    Ok(())
}

pub fn unlock(ctx: &Context<'_>, handle: Handle) -> Result<()> {
    let mutex = fetch(ctx, handle)?;
    let curr = ctx.thread.nucleus();
    if !mutex.synch.is_owner(mutex.word(), curr) {
        return_errno_with_message!(Errno::EPERM, "unlock by non-owner");
    }
    mutex.release_internal(curr);
    Ok(())
}

pub fn destroy(ctx: &Context<'_>, handle: Handle) -> Result<()> {
    let mutex = fetch(ctx, handle)?;
    if mutex.synch.is_held(mutex.word()) || mutex.synch.pended() {
        return_errno_with_message!(Errno::EBUSY, "mutex still held");
    }
    let mut conds = mutex.conds.lock();
    conds.retain(|cond| cond.upgrade().is_some());
    if !conds.is_empty() {
        return_errno_with_message!(Errno::EBUSY, "condvars still bound");
    }
    drop(conds);
    mutex.magic.store(0, Ordering::Release);
    ctx.kernel.registry().remove(handle)?;
    ctx.process
        .mutexq
        .lock()
        .retain(|candidate| !Arc::ptr_eq(candidate, &mutex));
    Ok(())
}

/// The user-side half of a mutex: magic, handle, lock-word offset and
/// the recursion count the kernel never sees.
pub struct ShadowMutex {
    magic: AtomicU32,
    handle: Handle,
    arena: Arena,
    dat_offset: u32,
    flags_offset: u32,
    attr: MutexAttr,
    lockcnt: AtomicU32,
}

impl ShadowMutex {
    /// Initializes a mutex and publishes its shadow.
    pub fn init(attr: MutexAttr) -> Result<ShadowMutex> {
        let mutex = crate::syscall::sys_mutex_init(attr)?;
        Ok(ShadowMutex {
            magic: AtomicU32::new(MUTEX_MAGIC),
            handle: mutex.handle(),
            arena: mutex.fastlock.arena().clone(),
            dat_offset: mutex.dat_offset(),
            flags_offset: mutex.flags_offset(),
            attr,
            lockcnt: AtomicU32::new(0),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Reads the error-checking bit from the flag word adjacent to
    /// the fastlock, as a foreign-process shadow would.
    pub fn is_errorcheck(&self) -> bool {
        self.arena.at(self.flags_offset).load(Ordering::Relaxed) & MUTEX_FLAG_ERRORCHECK != 0
    }

    pub(crate) fn dat_offset(&self) -> u32 {
        self.dat_offset
    }

    fn word(&self) -> &AtomicUsize {
        self.arena.at(self.dat_offset)
    }

    fn check_magic(&self) -> Result<()> {
        if self.magic.load(Ordering::Acquire) != MUTEX_MAGIC {
            return_errno!(Errno::EINVAL);
        }
        Ok(())
    }

    pub(crate) fn save_count(&self) -> u32 {
        self.lockcnt.load(Ordering::Relaxed)
    }

    pub(crate) fn restore_count(&self, count: u32) {
        self.lockcnt.store(count, Ordering::Relaxed);
    }

    pub fn lock(&self) -> Result<()> {
        self.timedlock(Timeout::Never)
    }

    pub fn timedlock(&self, timeout: Timeout) -> Result<()> {
        self.check_magic()?;
        let cur = CurrentContext::get()?;
        let nucleus = cur.thread().nucleus();
        if fastlock::fast_acquire(self.word(), nucleus.handle()) {
            if nucleus.state().contains(State::WEAK) {
                nucleus.inc_resource_count();
            }
            self.lockcnt.store(1, Ordering::Relaxed);
            return Ok(());
        }
        if fastlock::owner_of(self.word().load(Ordering::Relaxed)) == nucleus.handle() {
            return self.relock();
        }
        crate::syscall::sys_mutex_timedlock(self.handle, timeout)?;
        self.lockcnt.store(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn trylock(&self) -> Result<()> {
        self.check_magic()?;
        let cur = CurrentContext::get()?;
        let nucleus = cur.thread().nucleus();
        if fastlock::fast_acquire(self.word(), nucleus.handle()) {
            if nucleus.state().contains(State::WEAK) {
                nucleus.inc_resource_count();
            }
            self.lockcnt.store(1, Ordering::Relaxed);
            return Ok(());
        }
        if fastlock::owner_of(self.word().load(Ordering::Relaxed)) == nucleus.handle()
            && self.attr.typ == MutexType::Recursive
        {
            return self.relock();
        }
        return_errno!(Errno::EBUSY)
    }

    fn relock(&self) -> Result<()> {
        match self.attr.typ {
            MutexType::Recursive => {
                let count = self.lockcnt.load(Ordering::Relaxed);
                if count == u32::MAX {
                    return_errno_with_message!(Errno::EAGAIN, "recursion limit reached");
                }
                self.lockcnt.store(count + 1, Ordering::Relaxed);
                Ok(())
            }
            MutexType::ErrorCheck => return_errno!(Errno::EDEADLK),
            MutexType::Normal => {
                warn!("relocking a normal mutex would deadlock");
                return_errno!(Errno::EDEADLK)
            }
        }
    }

    pub fn unlock(&self) -> Result<()> {
        self.check_magic()?;
        let cur = CurrentContext::get()?;
        let nucleus = cur.thread().nucleus();
        let word = self.word();
        if fastlock::owner_of(word.load(Ordering::Relaxed)) != nucleus.handle() {
            return_errno_with_message!(Errno::EPERM, "unlock by non-owner");
        }
        let count = self.lockcnt.load(Ordering::Relaxed);
        if count > 1 {
            self.lockcnt.store(count - 1, Ordering::Relaxed);
            return Ok(());
        }
        self.lockcnt.store(0, Ordering::Relaxed);
        if fastlock::fast_release(word, nucleus.handle()) {
            if nucleus.state().contains(State::WEAK) {
                nucleus.dec_resource_count();
            }
            return Ok(());
        }
        crate::syscall::sys_mutex_unlock(self.handle)
    }

    pub fn destroy(&self) -> Result<()> {
        self.check_magic()?;
        crate::syscall::sys_mutex_destroy(self.handle)?;
        self.magic.store(0, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{RtThread, SchedParam};

    fn setup() -> (Arc<Kernel>, Arc<Process>, Arc<RtThread>) {
        let kernel = Kernel::new();
        let process = Process::new(&kernel);
        let thread = RtThread::attach_current(&process, "main", SchedParam::fifo(1)).unwrap();
        (kernel, process, thread)
    }

    #[test]
    fn uncontended_lock_cycle_stays_in_user_space() {
        let (_k, _p, thread) = setup();
        let mutex = ShadowMutex::init(MutexAttr::default()).unwrap();
        mutex.lock().unwrap();
        let word = mutex.word().load(Ordering::Relaxed);
        assert_eq!(fastlock::owner_of(word), thread.nucleus().handle());
        mutex.unlock().unwrap();
        assert_eq!(mutex.word().load(Ordering::Relaxed), 0);
        mutex.destroy().unwrap();
        assert_eq!(mutex.lock().unwrap_err().error(), Errno::EINVAL);
    }

    #[test]
    fn recursive_counts_in_user_space() {
        let (_k, _p, _t) = setup();
        let mutex = ShadowMutex::init(MutexAttr::recursive()).unwrap();
        mutex.lock().unwrap();
        mutex.lock().unwrap();
        mutex.trylock().unwrap();
        assert_eq!(mutex.save_count(), 3);
        mutex.unlock().unwrap();
        mutex.unlock().unwrap();
        // Still held after two of three unlocks.
        assert_eq!(mutex.destroy().unwrap_err().error(), Errno::EBUSY);
        mutex.unlock().unwrap();
        mutex.destroy().unwrap();
    }

    #[test]
    fn errorcheck_reports_deadlock_and_bad_unlock() {
        let (_k, process, _t) = setup();
        let attr = MutexAttr {
            typ: MutexType::ErrorCheck,
            ..Default::default()
        };
        let mutex = Arc::new(ShadowMutex::init(attr).unwrap());
        mutex.lock().unwrap();
        assert_eq!(mutex.lock().unwrap_err().error(), Errno::EDEADLK);

        let other = mutex.clone();
        let process = process.clone();
        let outsider = RtThread::spawn(&process, "outsider", SchedParam::fifo(1), move || {
            assert_eq!(other.unlock().unwrap_err().error(), Errno::EPERM);
            assert_eq!(other.trylock().unwrap_err().error(), Errno::EBUSY);
        })
        .unwrap();
        outsider.join().unwrap();
        mutex.unlock().unwrap();
        mutex.destroy().unwrap();
    }

    #[test]
    fn normal_relock_is_refused_with_a_diagnostic() {
        let (_k, _p, _t) = setup();
        let mutex = ShadowMutex::init(MutexAttr::default()).unwrap();
        mutex.lock().unwrap();
        assert_eq!(mutex.lock().unwrap_err().error(), Errno::EDEADLK);
        mutex.unlock().unwrap();
        mutex.destroy().unwrap();
    }
}
