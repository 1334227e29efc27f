// SPDX-License-Identifier: MPL-2.0

//! Shadow thread descriptors.
//!
//! An [`RtThread`] is the personality-side control block mirroring
//! one nucleus thread: registry handle, scheduling policy, the
//! monitor grant machinery, the signal state and the user window in
//! the arena. Threads are owned by their process container and
//! registered so fastlock words can name them.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;

use nucleus::arena::ArenaCell;
use nucleus::sync::{Policy, WaitQueue};
use nucleus::thread::{State, Thread};

use crate::config::{PRIO_MAX, PRIO_MIN};
use crate::prelude::*;
use crate::process::Process;
use crate::registry::Handle;
use crate::signal::{SigInfo, SigState};

pub type Tid = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedPolicy {
    /// First-in first-out real-time class.
    Fifo,
    /// Round-robin real-time class.
    RoundRobin,
    /// Non-real-time threads that only harden around critical
    /// sections.
    Weak,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedParam {
    pub policy: SchedPolicy,
    pub prio: i32,
}

impl SchedParam {
    pub fn fifo(prio: i32) -> Self {
        SchedParam {
            policy: SchedPolicy::Fifo,
            prio,
        }
    }

    pub fn weak() -> Self {
        SchedParam {
            policy: SchedPolicy::Weak,
            prio: 0,
        }
    }
}

/// Calling stage of a thread: hardened into the real-time scheduler,
/// or relaxed to the general-purpose one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Stage {
    Primary = 0,
    Relaxed = 1,
}

thread_local! {
    static CURRENT_RT: RefCell<Option<Arc<RtThread>>> = const { RefCell::new(None) };
}

pub struct RtThread {
    nucleus: Arc<Thread>,
    process: Weak<Process>,
    handle: AtomicU32,
    policy: SpinLock<SchedPolicy>,
    stage: AtomicU32,
    /// Thread-directed monitor wait object.
    monitor_wait: WaitQueue,
    /// User window word; carries the monitor grant value.
    window: ArenaCell,
    sig: SpinLock<SigState>,
    sigwait: WaitQueue,
    /// Direct-delivery slot filled by a signal sender that finds this
    /// thread sleeping in a signal wait.
    sig_slot: SpinLock<Option<SigInfo>>,
    join: SpinLock<Option<std::thread::JoinHandle<()>>>,
    exited: AtomicBool,
}

impl RtThread {
    fn build(
        nucleus: Arc<Thread>,
        process: &Arc<Process>,
        param: SchedParam,
    ) -> Result<Arc<RtThread>> {
        let Some(window) = process.arena().alloc_word() else {
            return_errno_with_message!(Errno::EAGAIN, "process arena exhausted");
        };
        nucleus.set_base_priority(param.prio);
        if param.policy == SchedPolicy::Weak {
            nucleus.set_state(State::WEAK);
        }
        let thread = Arc::new(RtThread {
            nucleus,
            process: Arc::downgrade(process),
            handle: AtomicU32::new(0),
            policy: SpinLock::new(param.policy),
            stage: AtomicU32::new(Stage::Primary as u32),
            monitor_wait: WaitQueue::new(Policy::Prio),
            window,
            sig: SpinLock::new(SigState::new()),
            sigwait: WaitQueue::new(Policy::Prio),
            sig_slot: SpinLock::new(None),
            join: SpinLock::new(None),
            exited: AtomicBool::new(false),
        });
        let handle = process
            .kernel()
            .registry()
            .enter_anon(thread.clone())?;
        thread.handle.store(handle.raw(), Ordering::Relaxed);
        thread.nucleus.set_handle(handle.raw());
        process.adopt_thread(thread.clone());
        Ok(thread)
    }

    /// Spawns a new thread of `process` running `body`.
    pub fn spawn<F>(
        process: &Arc<Process>,
        name: &str,
        param: SchedParam,
        body: F,
    ) -> Result<Arc<RtThread>>
    where
        F: FnOnce() + Send + 'static,
    {
        if !(PRIO_MIN..=PRIO_MAX).contains(&param.prio) {
            return_errno_with_message!(Errno::EINVAL, "priority out of range");
        }
        let (tx, rx) = mpsc::channel::<Arc<RtThread>>();
        let spawned = Thread::spawn(name, param.prio, move || {
            let Ok(rt) = rx.recv() else {
                return;
            };
            CURRENT_RT.with(|current| *current.borrow_mut() = Some(rt.clone()));
            body();
            CURRENT_RT.with(|current| *current.borrow_mut() = None);
            rt.exit_cleanup();
        })
        .map_err(|_| Error::with_message(Errno::EAGAIN, "host thread spawn failed"))?;
        let (tcb, join) = spawned.into_parts();
        let thread = match Self::build(tcb, process, param) {
            Ok(thread) => thread,
            Err(err) => {
                // The worker exits as soon as the channel closes.
                drop(tx);
                let _ = join.join();
                return Err(err);
            }
        };
        *thread.join.lock() = Some(join);
        tx.send(thread.clone())
            .expect("spawned thread vanished before binding");
        Ok(thread)
    }

    /// Attaches the calling host thread to `process`, making it a
    /// real-time thread. Returns the existing binding when called
    /// twice.
    pub fn attach_current(
        process: &Arc<Process>,
        name: &str,
        param: SchedParam,
    ) -> Result<Arc<RtThread>> {
        if let Some(existing) = Self::current() {
            return Ok(existing);
        }
        let _ = name;
        let thread = Self::build(Thread::current(), process, param)?;
        CURRENT_RT.with(|current| *current.borrow_mut() = Some(thread.clone()));
        Ok(thread)
    }

    /// The calling thread's binding, if any.
    pub fn current() -> Option<Arc<RtThread>> {
        CURRENT_RT.with(|current| current.borrow().clone())
    }

    /// Detaches the calling thread, tearing down its kernel state.
    pub fn detach_current() {
        let thread = CURRENT_RT.with(|current| current.borrow_mut().take());
        if let Some(thread) = thread {
            thread.exit_cleanup();
        }
    }

    pub fn tid(&self) -> Tid {
        self.nucleus.id()
    }

    pub fn name(&self) -> &str {
        self.nucleus.name()
    }

    pub fn handle(&self) -> Handle {
        Handle::from_raw(self.handle.load(Ordering::Relaxed))
    }

    pub fn nucleus(&self) -> &Arc<Thread> {
        &self.nucleus
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    pub fn schedparam(&self) -> SchedParam {
        SchedParam {
            policy: *self.policy.lock(),
            prio: self.nucleus.base_priority(),
        }
    }

    pub fn set_schedparam(&self, param: SchedParam) -> Result<()> {
        if !(PRIO_MIN..=PRIO_MAX).contains(&param.prio) {
            return_errno_with_message!(Errno::EINVAL, "priority out of range");
        }
        *self.policy.lock() = param.policy;
        if param.policy == SchedPolicy::Weak {
            self.nucleus.set_state(State::WEAK);
        } else {
            self.nucleus.clear_state(State::WEAK);
        }
        self.nucleus.set_base_priority(param.prio);
        Ok(())
    }

    pub fn stage(&self) -> Stage {
        if self.stage.load(Ordering::Relaxed) == Stage::Primary as u32 {
            Stage::Primary
        } else {
            Stage::Relaxed
        }
    }

    /// Switches the thread into the real-time stage.
    pub fn harden(&self) {
        if self.stage.swap(Stage::Primary as u32, Ordering::Relaxed) != Stage::Primary as u32 {
            self.nucleus.clear_state(State::RELAXED);
            trace!("{} hardened", self.name());
        }
    }

    /// Switches the thread to the general-purpose stage. Refused
    /// while the thread holds real-time resources.
    pub fn relax(&self) -> Result<()> {
        if self.nucleus.resource_count() > 0 {
            warn!(
                "{} attempts to relax while holding {} rt lock(s)",
                self.name(),
                self.nucleus.resource_count()
            );
            return_errno!(Errno::EPERM);
        }
        if self.stage.swap(Stage::Relaxed as u32, Ordering::Relaxed) != Stage::Relaxed as u32 {
            self.nucleus.set_state(State::RELAXED);
            trace!("{} relaxed", self.name());
        }
        Ok(())
    }

    /// Waits for the thread to finish.
    pub fn join(&self) -> Result<()> {
        if let Some(current) = Self::current() {
            if core::ptr::eq(current.as_ref(), self) {
                return_errno_with_message!(Errno::EDEADLK, "thread joining itself");
            }
        }
        let Some(join) = self.join.lock().take() else {
            return_errno_with_message!(Errno::EINVAL, "thread already joined or not joinable");
        };
        join.join()
            .map_err(|_| Error::with_message(Errno::EINVAL, "thread panicked"))
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    // Monitor plumbing.

    pub(crate) fn monitor_wait(&self) -> &WaitQueue {
        &self.monitor_wait
    }

    pub(crate) fn grant_value(&self) -> usize {
        self.window.word().load(Ordering::Acquire)
    }

    pub(crate) fn set_grant_value(&self, value: usize) {
        self.window.word().store(value, Ordering::Release);
    }

    // Signal plumbing.

    pub(crate) fn sig(&self) -> &SpinLock<SigState> {
        &self.sig
    }

    pub(crate) fn sigwait(&self) -> &WaitQueue {
        &self.sigwait
    }

    pub(crate) fn sig_slot(&self) -> &SpinLock<Option<SigInfo>> {
        &self.sig_slot
    }

    fn exit_cleanup(&self) {
        if self.exited.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(process) = self.process.upgrade() {
            crate::signal::flush_thread(process.kernel(), self);
            process.drop_thread(self);
            let _ = process.kernel().registry().remove(self.handle());
        }
    }
}

impl Drop for RtThread {
    fn drop(&mut self) {
        debug_assert!(
            self.exited.load(Ordering::Relaxed) || self.join.lock().is_none(),
            "rt thread dropped while alive"
        );
    }
}

/// Snapshot reported by the thread stat service.
#[derive(Clone, Debug)]
pub struct ThreadStat {
    pub tid: Tid,
    pub name: String,
    pub prio: i32,
    pub effective_prio: i32,
    pub stage: Stage,
}

pub fn stat(thread: &RtThread) -> ThreadStat {
    ThreadStat {
        tid: thread.tid(),
        name: thread.name().to_owned(),
        prio: thread.nucleus().base_priority(),
        effective_prio: thread.nucleus().effective_priority(),
        stage: thread.stage(),
    }
}
