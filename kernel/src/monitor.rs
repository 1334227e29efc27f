// SPDX-License-Identifier: MPL-2.0

//! Monitors.
//!
//! A monitor is a double-wait condition object serializing accesses
//! through a priority-inheriting gate. Consumers wait for a resource
//! to be granted; producers wait for the available resources to
//! drain. Grant signals are thread-directed (the signaler writes a
//! grant value into the target's user window), drain signals are
//! monitor-directed. Signaling happens in user space by setting bits
//! in the flags word; the kernel delivers when the signaler leaves
//! the monitor through `sync` or `exit`.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use nucleus::arena::{Arena, ArenaCell};
use nucleus::clock::{Nanos, Timeout};
use nucleus::sync::wait_queue::{FlushKind, WaitStatus};
use nucleus::sync::{fastlock, OwnedQueue, Policy, WaitQueue};
use nucleus::thread::{State, Thread};

use crate::clock::{self, ClockId};
use crate::context::{Context, CurrentContext};
use crate::prelude::*;
use crate::process::{Kernel, Pid, Process};
use crate::registry::Handle;
use crate::thread::RtThread;

pub(crate) const MONITOR_MAGIC: u32 = 0x8686_0303;

/// Bits of the monitor flags word, shared with user space.
pub const MONITOR_GRANTED: usize = 0x01;
pub const MONITOR_DRAINED: usize = 0x02;
pub const MONITOR_SIGNALED: usize = 0x04;
pub const MONITOR_BROADCAST: usize = 0x08;
pub const MONITOR_PENDED: usize = 0x10;

/// The two wait conditions of a monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorEvent {
    Grant,
    Drain,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorAttr {
    pub pshared: bool,
    pub clock: ClockId,
}

impl Default for MonitorAttr {
    fn default() -> Self {
        MonitorAttr {
            pshared: false,
            clock: ClockId::Monotonic,
        }
    }
}

pub struct Monitor {
    magic: AtomicU32,
    handle: AtomicU32,
    gate: OwnedQueue,
    gate_word: ArenaCell,
    flags: ArenaCell,
    drain: WaitQueue,
    /// Threads waiting for a grant; thread-directed wakeups go
    /// through each thread's own monitor wait object.
    waiters: SpinLock<Vec<Arc<RtThread>>>,
    attr: MonitorAttr,
    scope: Option<Pid>,
}

impl Monitor {
    pub(crate) fn create(process: &Arc<Process>, attr: MonitorAttr) -> Result<Arc<Monitor>> {
        let arena = process.arena_for(attr.pshared);
        let Some(gate_word) = arena.alloc_word() else {
            return_errno_with_message!(Errno::EAGAIN, "arena exhausted");
        };
        let Some(flags) = arena.alloc_word() else {
            return_errno_with_message!(Errno::EAGAIN, "arena exhausted");
        };
        let monitor = Arc::new(Monitor {
            magic: AtomicU32::new(MONITOR_MAGIC),
            handle: AtomicU32::new(0),
            gate: OwnedQueue::new(true),
            gate_word,
            flags,
            drain: WaitQueue::new(Policy::Prio),
            waiters: SpinLock::new(Vec::new()),
            attr,
            scope: process.scope_for(attr.pshared),
        });
        let handle = process.kernel().registry().enter_anon(monitor.clone())?;
        monitor.handle.store(handle.raw(), Ordering::Relaxed);
        process.monitorq.lock().push(monitor.clone());
        Ok(monitor)
    }

    pub(crate) fn handle(&self) -> Handle {
        Handle::from_raw(self.handle.load(Ordering::Relaxed))
    }

    fn is_alive(&self) -> bool {
        self.magic.load(Ordering::Acquire) == MONITOR_MAGIC
    }

    fn flags_word(&self) -> &AtomicUsize {
        self.flags.word()
    }

    fn clear_pended_if_idle(&self) {
        if self.waiters.lock().is_empty() && self.drain.count() == 0 {
            self.flags_word().fetch_and(!MONITOR_PENDED, Ordering::AcqRel);
        }
    }

    /// Wakes the waiters satisfied by the pending signals: grantees
    /// whose grant value was set (or all of them on broadcast), and
    /// one or all drain sleepers.
    fn wakeup(&self) {
        let flags = self.flags_word().load(Ordering::Acquire);
        let broadcast = flags & MONITOR_BROADCAST != 0;
        if flags & MONITOR_GRANTED != 0 {
            let mut waiters = self.waiters.lock();
            waiters.retain(|thread| {
                if broadcast || thread.grant_value() != 0 {
                    // A waiter may have timed out and not yet left the
                    // list; only drop the ones actually woken here.
                    if thread.monitor_wait().wake_one().is_some() {
                        return false;
                    }
                }
                true
            });
        }
        if flags & MONITOR_DRAINED != 0 && self.drain.count() > 0 {
            if broadcast {
                self.drain.wake_all();
            } else {
                self.drain.wake_one();
            }
        }
        self.flags_word().fetch_and(
            !(MONITOR_GRANTED | MONITOR_DRAINED | MONITOR_SIGNALED),
            Ordering::AcqRel,
        );
        self.clear_pended_if_idle();
    }

    pub(crate) fn force_destroy(self: &Arc<Monitor>, kernel: &Arc<Kernel>) {
        self.magic.store(0, Ordering::Release);
        self.gate.flush(FlushKind::Destroy);
        self.drain.flush(FlushKind::Destroy);
        for thread in self.waiters.lock().drain(..) {
            thread.monitor_wait().flush(FlushKind::Destroy);
        }
        let _ = kernel.registry().remove(self.handle());
    }
}

fn fetch(ctx: &Context<'_>, handle: Handle) -> Result<Arc<Monitor>> {
    let monitor = ctx.kernel.registry().fetch::<Monitor>(handle)?;
    if !monitor.is_alive() {
        return_errno!(Errno::EINVAL);
    }
    ctx.process.check_scope(monitor.scope)?;
    Ok(monitor)
}

fn gate_acquired(curr: &Arc<Thread>) {
    if curr.state().contains(State::WEAK) {
        curr.inc_resource_count();
    }
}

fn release_gate(monitor: &Monitor, curr: &Arc<Thread>) {
    monitor.gate.release(monitor.gate_word.word());
    if curr.state().contains(State::WEAK) {
        curr.dec_resource_count();
    }
}

/// Reacquires the gate after a wait. Interrupts do not abort the
/// reacquisition: wait returns holding the gate.
fn reenter_gate(ctx: &Context<'_>, monitor: &Arc<Monitor>) -> Result<()> {
    let resolve = |raw: u32| {
        ctx.kernel
            .registry()
            .fetch::<RtThread>(Handle::from_raw(raw))
            .ok()
            .map(|thread| thread.nucleus().clone())
    };
    loop {
        match monitor
            .gate
            .acquire(monitor.gate_word.word(), Timeout::Never, &resolve)
        {
            WaitStatus::Woken => break,
            WaitStatus::Interrupted => continue,
            _ => return_errno!(Errno::EINVAL),
        }
    }
    gate_acquired(ctx.thread.nucleus());
    monitor.flags_word().fetch_and(
        !(MONITOR_SIGNALED | MONITOR_BROADCAST),
        Ordering::AcqRel,
    );
    Ok(())
}

pub fn enter(ctx: &Context<'_>, handle: Handle) -> Result<()> {
    let monitor = fetch(ctx, handle)?;
    let resolve = |raw: u32| {
        ctx.kernel
            .registry()
            .fetch::<RtThread>(Handle::from_raw(raw))
            .ok()
            .map(|thread| thread.nucleus().clone())
    };
    match monitor
        .gate
        .acquire(monitor.gate_word.word(), Timeout::Never, &resolve)
    {
        WaitStatus::Woken => {}
        WaitStatus::Interrupted => return_errno!(Errno::EINTR),
        _ => return_errno!(Errno::EINVAL),
    }
    gate_acquired(ctx.thread.nucleus());
    monitor.flags_word().fetch_and(
        !(MONITOR_SIGNALED | MONITOR_BROADCAST),
        Ordering::AcqRel,
    );
    Ok(())
}

/// Releases the gate and sleeps on the selected condition, then takes
/// the gate back. `Ok` means signaled; `ETIMEDOUT` and `EINTR` also
/// return with the gate held.
pub fn wait(
    ctx: &Context<'_>,
    handle: Handle,
    event: MonitorEvent,
    deadline: Option<Nanos>,
) -> Result<()> {
    let monitor = fetch(ctx, handle)?;
    let curr = ctx.thread.nucleus();
    if !monitor.gate.is_owner(monitor.gate_word.word(), curr) {
        return_errno_with_message!(Errno::EPERM, "waiting without the gate");
    }
    // The caller may have signaled the monitor it is about to sleep
    // on; wake the satisfied waiters first.
    if monitor.flags_word().load(Ordering::Acquire) & MONITOR_SIGNALED != 0 {
        monitor.wakeup();
    }
    let timeout = match deadline {
        None => Timeout::Never,
        Some(ns) => clock::to_timeout(ctx.kernel, monitor.attr.clock, ns),
    };

    let sleeper = match event {
        MonitorEvent::Drain => monitor.drain.prepare(0),
        MonitorEvent::Grant => {
            ctx.thread.set_grant_value(0);
            monitor.waiters.lock().push(ctx.thread.clone());
            ctx.thread.monitor_wait().prepare(0)
        }
    };
    monitor.flags_word().fetch_or(MONITOR_PENDED, Ordering::AcqRel);
    release_gate(&monitor, curr);

    let wakeup = sleeper.wait(timeout);
    let outcome: Result<()> = match wakeup.status {
        WaitStatus::Woken => Ok(()),
        WaitStatus::Timedout => Err(Error::new(Errno::ETIMEDOUT)),
        WaitStatus::Interrupted => Err(Error::new(Errno::EINTR)),
        WaitStatus::Destroyed => return_errno!(Errno::EINVAL),
    };
    if outcome.is_err() {
        if event == MonitorEvent::Grant {
            monitor
                .waiters
                .lock()
                .retain(|thread| !Arc::ptr_eq(thread, ctx.thread));
        }
        monitor.clear_pended_if_idle();
    }
    reenter_gate(ctx, &monitor)?;
    outcome
}

/// Wakes satisfied waiters without leaving the monitor: release the
/// gate, let them run, take it back.
pub fn sync(ctx: &Context<'_>, handle: Handle) -> Result<()> {
    let monitor = fetch(ctx, handle)?;
    let curr = ctx.thread.nucleus();
    if monitor.flags_word().load(Ordering::Acquire) & MONITOR_SIGNALED != 0 {
        if !monitor.gate.is_owner(monitor.gate_word.word(), curr) {
            return_errno_with_message!(Errno::EPERM, "sync without the gate");
        }
        monitor.wakeup();
        release_gate(&monitor, curr);
        reenter_gate(ctx, &monitor)?;
    }
    Ok(())
}

/// Wakes satisfied waiters and leaves the monitor.
pub fn exit(ctx: &Context<'_>, handle: Handle) -> Result<()> {
    let monitor = fetch(ctx, handle)?;
    let curr = ctx.thread.nucleus();
    if !monitor.gate.is_owner(monitor.gate_word.word(), curr) {
        return_errno_with_message!(Errno::EPERM, "exit without the gate");
    }
    if monitor.flags_word().load(Ordering::Acquire) & MONITOR_SIGNALED != 0 {
        monitor.wakeup();
    }
    release_gate(&monitor, curr);
    Ok(())
}

pub fn destroy(ctx: &Context<'_>, handle: Handle) -> Result<()> {
    let monitor = fetch(ctx, handle)?;
    let curr = ctx.thread.nucleus();
    let flags = monitor.flags_word().load(Ordering::Acquire);
    if flags & MONITOR_PENDED != 0
        || monitor.drain.count() > 0
        || !monitor.waiters.lock().is_empty()
    {
        return_errno_with_message!(Errno::EBUSY, "monitor has waiters");
    }
    if !monitor.gate.is_owner(monitor.gate_word.word(), curr) {
        return_errno_with_message!(Errno::EPERM, "destroy requires holding the gate");
    }
    monitor.magic.store(0, Ordering::Release);
    release_gate(&monitor, curr);
    ctx.kernel.registry().remove(handle)?;
    ctx.process
        .monitorq
        .lock()
        .retain(|candidate| !Arc::ptr_eq(candidate, &monitor));
    Ok(())
}

/// User-side half of a monitor.
pub struct ShadowMonitor {
    magic: AtomicU32,
    handle: Handle,
    arena: Arena,
    gate_offset: u32,
    flags_offset: u32,
}

impl ShadowMonitor {
    pub fn init(attr: MonitorAttr) -> Result<ShadowMonitor> {
        let monitor = crate::syscall::sys_monitor_init(attr)?;
        Ok(ShadowMonitor {
            magic: AtomicU32::new(MONITOR_MAGIC),
            handle: monitor.handle(),
            arena: monitor.gate_word.arena().clone(),
            gate_offset: monitor.gate_word.offset(),
            flags_offset: monitor.flags.offset(),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    fn check_magic(&self) -> Result<()> {
        if self.magic.load(Ordering::Acquire) != MONITOR_MAGIC {
            return_errno!(Errno::EINVAL);
        }
        Ok(())
    }

    fn flags(&self) -> &AtomicUsize {
        self.arena.at(self.flags_offset)
    }

    pub fn enter(&self) -> Result<()> {
        self.check_magic()?;
        let cur = CurrentContext::get()?;
        let nucleus = cur.thread().nucleus();
        if fastlock::fast_acquire(self.arena.at(self.gate_offset), nucleus.handle()) {
            if nucleus.state().contains(State::WEAK) {
                nucleus.inc_resource_count();
            }
            self.flags().fetch_and(
                !(MONITOR_SIGNALED | MONITOR_BROADCAST),
                Ordering::AcqRel,
            );
            return Ok(());
        }
        crate::syscall::sys_monitor_enter(self.handle)
    }

    /// Leaves the monitor. With nobody waiting and no signal pending
    /// this is a single compare-and-set.
    pub fn exit(&self) -> Result<()> {
        self.check_magic()?;
        let cur = CurrentContext::get()?;
        let nucleus = cur.thread().nucleus();
        let flags = self.flags().load(Ordering::Acquire);
        if flags & (MONITOR_SIGNALED | MONITOR_PENDED) == 0
            && fastlock::fast_release(self.arena.at(self.gate_offset), nucleus.handle())
        {
            if nucleus.state().contains(State::WEAK) {
                nucleus.dec_resource_count();
            }
            return Ok(());
        }
        crate::syscall::sys_monitor_exit(self.handle)
    }

    pub fn wait(&self, event: MonitorEvent, deadline: Option<Nanos>) -> Result<()> {
        self.check_magic()?;
        crate::syscall::sys_monitor_wait(self.handle, event, deadline)
    }

    /// Marks a grant for `target`. Caller must hold the gate; the
    /// delivery happens on the next `sync` or `exit`.
    pub fn grant(&self, target: &RtThread) {
        target.set_grant_value(1);
        self.flags()
            .fetch_or(MONITOR_GRANTED | MONITOR_SIGNALED, Ordering::AcqRel);
    }

    pub fn grant_broadcast(&self) {
        self.flags().fetch_or(
            MONITOR_GRANTED | MONITOR_SIGNALED | MONITOR_BROADCAST,
            Ordering::AcqRel,
        );
    }

    pub fn drain_signal(&self) {
        self.flags()
            .fetch_or(MONITOR_DRAINED | MONITOR_SIGNALED, Ordering::AcqRel);
    }

    pub fn drain_broadcast(&self) {
        self.flags().fetch_or(
            MONITOR_DRAINED | MONITOR_SIGNALED | MONITOR_BROADCAST,
            Ordering::AcqRel,
        );
    }

    /// Wakes satisfied waiters without leaving the monitor. Pure user
    /// space when no signal is pending.
    pub fn sync(&self) -> Result<()> {
        self.check_magic()?;
        if self.flags().load(Ordering::Acquire) & MONITOR_SIGNALED == 0 {
            return Ok(());
        }
        crate::syscall::sys_monitor_sync(self.handle)
    }

    pub fn destroy(&self) -> Result<()> {
        self.check_magic()?;
        crate::syscall::sys_monitor_destroy(self.handle)?;
        self.magic.store(0, Ordering::Release);
        Ok(())
    }
}
