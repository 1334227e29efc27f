// SPDX-License-Identifier: MPL-2.0

//! The kernel instance and per-process contexts.
//!
//! A [`Kernel`] owns the cross-process state: the handle registry,
//! the system arena backing process-shared objects, the signal
//! notification pool and the timer wheel. A [`Process`] owns one
//! container per object kind, the descriptor table, the timer slots
//! and a private arena; tearing a process down walks the containers
//! leaves-first so that every remaining waiter is flushed before the
//! object underneath it disappears.

use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use id_alloc::IdAlloc;
use nucleus::arena::Arena;
use nucleus::timer::TimerWheel;

use crate::config::{NRDESCS, PROCESS_ARENA_WORDS, SYSTEM_ARENA_WORDS};
use crate::cond::Cond;
use crate::event::Event;
use crate::monitor::Monitor;
use crate::mq::Mqd;
use crate::mutex::Mutex;
use crate::prelude::*;
use crate::registry::Registry;
use crate::sem::{NamedSemDesc, Sem};
use crate::signal::SigPool;
use crate::thread::RtThread;
use crate::timer::ProcTimer;

pub type Pid = u32;

pub struct Kernel {
    registry: Registry,
    sys_arena: Arena,
    signal_pool: SigPool,
    wheel: TimerWheel,
    realtime_offset: AtomicI64,
    next_pid: AtomicU32,
}

impl Kernel {
    pub fn new() -> Arc<Kernel> {
        Arc::new(Kernel {
            registry: Registry::new(),
            sys_arena: Arena::new(SYSTEM_ARENA_WORDS),
            signal_pool: SigPool::new(),
            wheel: TimerWheel::new(),
            realtime_offset: AtomicI64::new(0),
            next_pid: AtomicU32::new(1),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn sys_arena(&self) -> &Arena {
        &self.sys_arena
    }

    pub(crate) fn signal_pool(&self) -> &SigPool {
        &self.signal_pool
    }

    pub(crate) fn wheel(&self) -> &TimerWheel {
        &self.wheel
    }

    pub(crate) fn realtime_offset(&self) -> &AtomicI64 {
        &self.realtime_offset
    }
}

/// A user-facing descriptor owned by the process handle table.
pub(crate) enum Descriptor {
    Mq(Mqd),
    NamedSem(NamedSemDesc),
}

pub(crate) struct DescTable {
    alloc: IdAlloc,
    entries: HashMap<i32, Descriptor>,
}

impl DescTable {
    fn new() -> Self {
        DescTable {
            alloc: IdAlloc::with_capacity(NRDESCS),
            entries: HashMap::new(),
        }
    }

    pub(crate) fn install(&mut self, desc: Descriptor) -> Result<i32> {
        let Some(fd) = self.alloc.alloc() else {
            return_errno_with_message!(Errno::EAGAIN, "descriptor table full");
        };
        let fd = fd as i32;
        self.entries.insert(fd, desc);
        Ok(fd)
    }

    pub(crate) fn get(&self, fd: i32) -> Result<&Descriptor> {
        self.entries
            .get(&fd)
            .ok_or_else(|| Error::new(Errno::EBADF))
    }

    pub(crate) fn remove(&mut self, fd: i32) -> Result<Descriptor> {
        let Some(desc) = self.entries.remove(&fd) else {
            return_errno!(Errno::EBADF);
        };
        self.alloc.free(fd as usize);
        Ok(desc)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&i32, &Descriptor)> {
        self.entries.iter()
    }

    fn drain(&mut self) -> Vec<Descriptor> {
        let fds: Vec<i32> = self.entries.keys().copied().collect();
        let mut out = Vec::new();
        for fd in fds {
            if let Some(desc) = self.entries.remove(&fd) {
                self.alloc.free(fd as usize);
                out.push(desc);
            }
        }
        out
    }
}

pub struct Process {
    kernel: Arc<Kernel>,
    pid: Pid,
    arena: Arena,
    pub(crate) mutexq: SpinLock<Vec<Arc<Mutex>>>,
    pub(crate) condq: SpinLock<Vec<Arc<Cond>>>,
    pub(crate) semq: SpinLock<Vec<Arc<Sem>>>,
    pub(crate) monitorq: SpinLock<Vec<Arc<Monitor>>>,
    pub(crate) eventq: SpinLock<Vec<Arc<Event>>>,
    pub(crate) timers: SpinLock<TimerTable>,
    pub(crate) descs: SpinLock<DescTable>,
    threads: SpinLock<Vec<Arc<RtThread>>>,
    dead: AtomicBool,
}

pub(crate) struct TimerTable {
    alloc: IdAlloc,
    slots: HashMap<usize, Arc<ProcTimer>>,
}

impl TimerTable {
    fn new() -> Self {
        TimerTable {
            alloc: IdAlloc::with_capacity(crate::config::NRTIMERS),
            slots: HashMap::new(),
        }
    }

    pub(crate) fn alloc_id(&mut self) -> Result<usize> {
        self.alloc
            .alloc()
            .ok_or_else(|| Error::with_message(Errno::EAGAIN, "timer ids exhausted"))
    }

    pub(crate) fn free_id(&mut self, id: usize) {
        self.slots.remove(&id);
        self.alloc.free(id);
    }

    pub(crate) fn install(&mut self, id: usize, timer: Arc<ProcTimer>) {
        self.slots.insert(id, timer);
    }

    pub(crate) fn get(&self, id: usize) -> Option<Arc<ProcTimer>> {
        self.slots.get(&id).cloned()
    }

    fn drain(&mut self) -> Vec<Arc<ProcTimer>> {
        let timers: Vec<_> = self.slots.values().cloned().collect();
        let ids: Vec<_> = self.slots.keys().copied().collect();
        for id in ids {
            self.free_id(id);
        }
        timers
    }
}

impl Process {
    pub fn new(kernel: &Arc<Kernel>) -> Arc<Process> {
        let pid = kernel.next_pid.fetch_add(1, Ordering::Relaxed);
        Arc::new(Process {
            kernel: kernel.clone(),
            pid,
            arena: Arena::new(PROCESS_ARENA_WORDS),
            mutexq: SpinLock::new(Vec::new()),
            condq: SpinLock::new(Vec::new()),
            semq: SpinLock::new(Vec::new()),
            monitorq: SpinLock::new(Vec::new()),
            eventq: SpinLock::new(Vec::new()),
            timers: SpinLock::new(TimerTable::new()),
            descs: SpinLock::new(DescTable::new()),
            threads: SpinLock::new(Vec::new()),
            dead: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Arena the object scope selects: the system arena for
    /// process-shared objects, the private one otherwise.
    pub(crate) fn arena_for(&self, pshared: bool) -> &Arena {
        if pshared {
            self.kernel.sys_arena()
        } else {
            &self.arena
        }
    }

    /// Owning scope recorded on a new object: `None` for shared
    /// objects reachable from any process.
    pub(crate) fn scope_for(&self, pshared: bool) -> Option<Pid> {
        (!pshared).then_some(self.pid)
    }

    /// Scope check shared by every operation: a private object may
    /// only be touched from its owning process.
    pub(crate) fn check_scope(&self, owner: Option<Pid>) -> Result<()> {
        match owner {
            Some(pid) if pid != self.pid => {
                return_errno_with_message!(Errno::EPERM, "object belongs to another process")
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn adopt_thread(&self, thread: Arc<RtThread>) {
        self.threads.lock().push(thread);
    }

    pub(crate) fn drop_thread(&self, thread: &RtThread) {
        self.threads
            .lock()
            .retain(|candidate| !core::ptr::eq(candidate.as_ref(), thread));
    }

    pub fn threads(&self) -> Vec<Arc<RtThread>> {
        self.threads.lock().clone()
    }

    pub fn thread_by_tid(&self, tid: u64) -> Option<Arc<RtThread>> {
        self.threads
            .lock()
            .iter()
            .find(|thread| thread.tid() == tid)
            .cloned()
    }

    /// Tears the process down, leaves first: timers, descriptors,
    /// monitors, events, condvars, semaphores, mutexes. Remaining
    /// waiters are flushed with a destroyed status by each kind's
    /// force-destroy path. Idempotent.
    pub fn cleanup(&self) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        for timer in self.timers.lock().drain() {
            timer.shutdown();
        }
        for desc in self.descs.lock().drain() {
            match desc {
                Descriptor::Mq(mqd) => mqd.release(&self.kernel),
                Descriptor::NamedSem(desc) => desc.release(&self.kernel),
            }
        }
        for monitor in self.monitorq.lock().drain(..) {
            monitor.force_destroy(&self.kernel);
        }
        for event in self.eventq.lock().drain(..) {
            event.force_destroy(&self.kernel);
        }
        for cond in self.condq.lock().drain(..) {
            cond.force_destroy(&self.kernel);
        }
        for sem in self.semq.lock().drain(..) {
            sem.force_destroy(&self.kernel);
        }
        for mutex in self.mutexq.lock().drain(..) {
            mutex.force_destroy(&self.kernel);
        }
        self.threads.lock().clear();
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.cleanup();
    }
}
