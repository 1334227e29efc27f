// SPDX-License-Identifier: MPL-2.0

//! Event flag groups.
//!
//! A long word of user-defined event bits in the arena. Waiters block
//! until the awaited mask is satisfied conjunctively (ALL) or
//! disjunctively (ANY); user space mutates the value word directly
//! and calls `sync` to wake whoever became satisfied. The inquiry
//! service snapshots the group and its wait list, revalidating the
//! handle with the registry stamp across its unlocked allocation.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use nucleus::arena::{Arena, ArenaCell};
use nucleus::clock::{Nanos, Timeout};
use nucleus::sync::wait_queue::{FlushKind, WaitStatus};
use nucleus::sync::{Policy, WaitQueue};

use crate::clock::{self, ClockId};
use crate::context::Context;
use crate::prelude::*;
use crate::process::{Kernel, Pid, Process};
use crate::registry::Handle;

pub(crate) const EVENT_MAGIC: u32 = 0x8686_0306;

/// Bit of the flags word set while any thread waits on the group.
pub const EVENT_PENDED: usize = 0x1;

/// How a waiter's mask must be satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventMode {
    /// Every awaited bit must be set.
    All,
    /// Any awaited bit suffices.
    Any,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventAttr {
    pub pshared: bool,
    /// Priority wakeup order instead of FIFO.
    pub prio: bool,
}

impl Default for EventAttr {
    fn default() -> Self {
        EventAttr {
            pshared: false,
            prio: false,
        }
    }
}

const TAG_ANY: u64 = 1 << 32;

fn pack_tag(mask: u32, mode: EventMode) -> u64 {
    mask as u64 | if mode == EventMode::Any { TAG_ANY } else { 0 }
}

fn satisfied(tag: u64, value: u32) -> Option<u32> {
    let mask = tag as u32;
    let hit = mask & value;
    let test = if tag & TAG_ANY != 0 { hit } else { mask };
    (hit != 0 && hit == test).then_some(hit)
}

pub struct Event {
    magic: AtomicU32,
    handle: AtomicU32,
    synch: WaitQueue,
    value: ArenaCell,
    flags: ArenaCell,
    nwaiters: ArenaCell,
    attr: EventAttr,
    scope: Option<Pid>,
    /// Serializes the test-and-sleep path against `sync`.
    lock: SpinLock<()>,
}

impl Event {
    pub(crate) fn create(
        process: &Arc<Process>,
        value: u32,
        attr: EventAttr,
    ) -> Result<Arc<Event>> {
        let arena = process.arena_for(attr.pshared);
        let cells = (
            arena.alloc_word(),
            arena.alloc_word(),
            arena.alloc_word(),
        );
        let (Some(value_cell), Some(flags_cell), Some(nwaiters_cell)) = cells else {
            return_errno_with_message!(Errno::EAGAIN, "arena exhausted");
        };
        value_cell.word().store(value as usize, Ordering::Release);
        let policy = if attr.prio { Policy::Prio } else { Policy::Fifo };
        let event = Arc::new(Event {
            magic: AtomicU32::new(EVENT_MAGIC),
            handle: AtomicU32::new(0),
            synch: WaitQueue::new(policy),
            value: value_cell,
            flags: flags_cell,
            nwaiters: nwaiters_cell,
            attr,
            scope: process.scope_for(attr.pshared),
            lock: SpinLock::new(()),
        });
        let handle = process.kernel().registry().enter_anon(event.clone())?;
        event.handle.store(handle.raw(), Ordering::Relaxed);
        process.eventq.lock().push(event.clone());
        Ok(event)
    }

    pub(crate) fn handle(&self) -> Handle {
        Handle::from_raw(self.handle.load(Ordering::Relaxed))
    }

    fn is_alive(&self) -> bool {
        self.magic.load(Ordering::Acquire) == EVENT_MAGIC
    }

    fn value_word(&self) -> &AtomicUsize {
        self.value.word()
    }

    pub(crate) fn force_destroy(self: &Arc<Event>, kernel: &Arc<Kernel>) {
        self.magic.store(0, Ordering::Release);
        self.synch.flush(FlushKind::Destroy);
        let _ = kernel.registry().remove(self.handle());
    }
}

fn fetch(ctx: &Context<'_>, handle: Handle) -> Result<Arc<Event>> {
    let event = ctx.kernel.registry().fetch::<Event>(handle)?;
    if !event.is_alive() {
        return_errno!(Errno::EINVAL);
    }
    ctx.process.check_scope(event.scope)?;
    Ok(event)
}

/// Waits for `mask` under `mode`, returning the satisfied bits.
///
/// A zero mask reads the current value without waiting. A `deadline`
/// equal to the current time probes without blocking and reports
/// `EWOULDBLOCK` (as `EAGAIN`) on an unsatisfied predicate.
pub fn wait(
    ctx: &Context<'_>,
    handle: Handle,
    mask: u32,
    mode: EventMode,
    deadline: Option<Nanos>,
) -> Result<u32> {
    let event = fetch(ctx, handle)?;
    if mask == 0 {
        return Ok(event.value_word().load(Ordering::Acquire) as u32);
    }
    // A zero deadline is the non-blocking probe.
    let nonblock = deadline == Some(0);
    let timeout = match deadline {
        None => Timeout::Never,
        Some(ns) => clock::to_timeout(ctx.kernel, ClockId::Monotonic, ns),
    };

    let guard = event.lock.lock();
    // PENDED goes up before the predicate test; the user-space post
    // path writes its bits first and reads PENDED second, so one of
    // the two sides always notices the other.
    event.flags.word().fetch_or(EVENT_PENDED, Ordering::SeqCst);
    let value = event.value_word().load(Ordering::SeqCst) as u32;
    let hit = satisfied(pack_tag(mask, mode), value);
    if hit.is_some() || nonblock {
        if event.synch.count() == 0 {
            event.flags.word().fetch_and(!EVENT_PENDED, Ordering::AcqRel);
        }
        drop(guard);
        return match hit {
            Some(hit) => Ok(hit),
            None => Err(Error::new(Errno::EAGAIN)),
        };
    }
    event.nwaiters.word().fetch_add(1, Ordering::AcqRel);
    let sleeper = event.synch.prepare(pack_tag(mask, mode));
    drop(guard);

    let wakeup = sleeper.wait(timeout);
    match wakeup.status {
        WaitStatus::Woken => Ok(wakeup.payload.unwrap_or(0) as u32),
        status => {
            let _guard = event.lock.lock();
            event.nwaiters.word().fetch_sub(1, Ordering::AcqRel);
            if event.synch.count() == 0 {
                event.flags.word().fetch_and(!EVENT_PENDED, Ordering::AcqRel);
            }
            match status {
                WaitStatus::Timedout => return_errno!(Errno::ETIMEDOUT),
                WaitStatus::Interrupted => return_errno!(Errno::EINTR),
                _ => return_errno!(Errno::EINVAL),
            }
        }
    }
}

/// Wakes every waiter whose predicate the current value satisfies.
/// User space mutates the value word first, then syncs.
pub fn sync(ctx: &Context<'_>, handle: Handle) -> Result<()> {
    let event = fetch(ctx, handle)?;
    let _guard = event.lock.lock();
    let value = event.value_word().load(Ordering::Acquire) as u32;
    let woken = event.synch.wake_matching(|tag| {
        satisfied(tag, value).map(|hit| hit as u64)
    });
    if woken > 0 {
        event
            .nwaiters
            .word()
            .fetch_sub(woken, Ordering::AcqRel);
    }
    if event.synch.count() == 0 {
        event.flags.word().fetch_and(!EVENT_PENDED, Ordering::AcqRel);
    }
    Ok(())
}

/// Stable snapshot of an event group.
#[derive(Clone, Debug)]
pub struct EventInfo {
    pub value: u32,
    pub pended: bool,
    pub nwaiters: usize,
    pub waiters: Vec<u64>,
}

/// Snapshots the group and its wait list. The output list is sized
/// without holding the group stable, so the handle is revalidated
/// through the registry stamp and the operation restarts when the
/// slot moved underneath it.
pub fn inquire(ctx: &Context<'_>, handle: Handle) -> Result<EventInfo> {
    loop {
        let (event, stamp) = ctx.kernel.registry().fetch_stamped::<Event>(handle)?;
        if !event.is_alive() {
            return_errno!(Errno::EINVAL);
        }
        let expect = event.synch.count();
        // Simulates the unlocked buffer allocation of the original
        // protocol: the registry slot may be reused right here.
        let waiters: Vec<u64> = event
            .synch
            .waiter_threads()
            .into_iter()
            .take(expect)
            .map(|thread| thread.id())
            .collect();
        let (checked, restamp) = ctx.kernel.registry().fetch_stamped::<Event>(handle)?;
        if !Arc::ptr_eq(&event, &checked) || stamp != restamp {
            continue;
        }
        return Ok(EventInfo {
            value: event.value_word().load(Ordering::Acquire) as u32,
            pended: event.flags.word().load(Ordering::Acquire) & EVENT_PENDED != 0,
            nwaiters: event.nwaiters.word().load(Ordering::Acquire),
            waiters,
        });
    }
}

pub fn destroy(ctx: &Context<'_>, handle: Handle) -> Result<()> {
    let event = fetch(ctx, handle)?;
    event.magic.store(0, Ordering::Release);
    event.synch.flush(FlushKind::Destroy);
    ctx.kernel.registry().remove(handle)?;
    ctx.process
        .eventq
        .lock()
        .retain(|candidate| !Arc::ptr_eq(candidate, &event));
    Ok(())
}

/// User-side half of an event group.
pub struct ShadowEvent {
    magic: AtomicU32,
    handle: Handle,
    arena: Arena,
    value_offset: u32,
    flags_offset: u32,
}

impl ShadowEvent {
    pub fn init(value: u32, attr: EventAttr) -> Result<ShadowEvent> {
        let event = crate::syscall::sys_event_init(value, attr)?;
        Ok(ShadowEvent {
            magic: AtomicU32::new(EVENT_MAGIC),
            handle: event.handle(),
            arena: event.value.arena().clone(),
            value_offset: event.value.offset(),
            flags_offset: event.flags.offset(),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    fn check_magic(&self) -> Result<()> {
        if self.magic.load(Ordering::Acquire) != EVENT_MAGIC {
            return_errno!(Errno::EINVAL);
        }
        Ok(())
    }

    /// Sets event bits and wakes the newly satisfied waiters. The
    /// value mutation is pure user space; the sync syscall is skipped
    /// while nobody waits.
    pub fn post(&self, bits: u32) -> Result<()> {
        self.check_magic()?;
        self.arena
            .at(self.value_offset)
            .fetch_or(bits as usize, Ordering::SeqCst);
        if self.arena.at(self.flags_offset).load(Ordering::SeqCst) & EVENT_PENDED != 0 {
            return crate::syscall::sys_event_sync(self.handle);
        }
        Ok(())
    }

    /// Clears event bits.
    pub fn clear(&self, bits: u32) -> Result<u32> {
        self.check_magic()?;
        let old = self
            .arena
            .at(self.value_offset)
            .fetch_and(!(bits as usize), Ordering::AcqRel);
        Ok(old as u32)
    }

    pub fn wait(&self, mask: u32, mode: EventMode, deadline: Option<Nanos>) -> Result<u32> {
        self.check_magic()?;
        crate::syscall::sys_event_wait(self.handle, mask, mode, deadline)
    }

    /// Non-blocking probe.
    pub fn trywait(&self, mask: u32, mode: EventMode) -> Result<u32> {
        self.check_magic()?;
        crate::syscall::sys_event_wait(self.handle, mask, mode, Some(0))
    }

    pub fn sync(&self) -> Result<()> {
        self.check_magic()?;
        crate::syscall::sys_event_sync(self.handle)
    }

    pub fn inquire(&self) -> Result<EventInfo> {
        self.check_magic()?;
        crate::syscall::sys_event_inquire(self.handle)
    }

    pub fn destroy(&self) -> Result<()> {
        self.check_magic()?;
        crate::syscall::sys_event_destroy(self.handle)?;
        self.magic.store(0, Ordering::Release);
        Ok(())
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
        RtThread::attach_current(&process, "event-test", SchedParam::fifo(1)).unwrap();
        (kernel, process)
    }

    #[test]
    fn zero_mask_reads_the_group() {
        let (_kernel, _process) = setup();
        let event = ShadowEvent::init(0b1100, EventAttr::default()).unwrap();
        assert_eq!(event.wait(0, EventMode::Any, None).unwrap(), 0b1100);
        event.destroy().unwrap();
    }

    #[test]
    fn nonblocking_probe_honors_both_modes() {
        let (_kernel, _process) = setup();
        let event = ShadowEvent::init(0b0101, EventAttr::default()).unwrap();
        assert_eq!(event.trywait(0b0001, EventMode::All).unwrap(), 0b0001);
        assert_eq!(event.trywait(0b0011, EventMode::Any).unwrap(), 0b0001);
        // ALL needs every bit of the mask.
        assert_eq!(
            event.trywait(0b0011, EventMode::All).unwrap_err().error(),
            Errno::EAGAIN
        );
        event.destroy().unwrap();
    }

    #[test]
    fn all_mode_waits_for_the_full_mask() {
        let (_kernel, process) = setup();
        let event = Arc::new(ShadowEvent::init(0, EventAttr::default()).unwrap());
        let e = event.clone();
        let waiter = RtThread::spawn(&process, "all-waiter", SchedParam::fifo(2), move || {
            let bits = e.wait(0b0110, EventMode::All, None).unwrap();
            assert_eq!(bits, 0b0110);
        })
        .unwrap();
        let deadline = std::time::Instant::now() + core::time::Duration::from_secs(5);
        while event.inquire().unwrap().nwaiters != 1 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::yield_now();
        }
        // The first bit alone satisfies nothing.
        event.post(0b0010).unwrap();
        std::thread::sleep(core::time::Duration::from_millis(20));
        assert_eq!(event.inquire().unwrap().nwaiters, 1);
        event.post(0b0100).unwrap();
        waiter.join().unwrap();
        let info = event.inquire().unwrap();
        assert_eq!(info.nwaiters, 0);
        assert!(!info.pended);
        event.destroy().unwrap();
    }

    #[test]
    fn clearing_bits_reports_the_old_value() {
        let (_kernel, _process) = setup();
        let event = ShadowEvent::init(0b1111, EventAttr::default()).unwrap();
        assert_eq!(event.clear(0b0011).unwrap(), 0b1111);
        assert_eq!(event.wait(0, EventMode::Any, None).unwrap(), 0b1100);
        event.destroy().unwrap();
    }
}
