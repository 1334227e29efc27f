// SPDX-License-Identifier: MPL-2.0

//! Thread-directed signal dispatch.
//!
//! Every thread carries a pending bitmap and one FIFO of queued
//! notifications per signal number, all backed by a bounded global
//! pool of records. A sender whose notification matches one already
//! queued (same code, same source) bumps that record's overrun count
//! instead of consuming another slot; non-real-time numbers never
//! queue more than one record. A sender that finds the target
//! sleeping in a signal wait for a matching set skips the queue
//! entirely and hands the notification over in place.

use nucleus::clock::{Nanos, Timeout};
use nucleus::sync::wait_queue::WaitStatus;

use crate::config::{DELAYMAX, NSIG, SIGRTMIN};
use crate::context::Context;
use crate::prelude::*;
use crate::process::Kernel;
use crate::thread::RtThread;

/// Origin of a queued notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SigCode {
    /// Explicitly queued with a value payload.
    Queue,
    /// Interval timer expiry.
    Timer,
    /// Message arrival notification.
    MesgQ,
    /// Plain thread kill.
    Kill,
}

#[derive(Clone, Copy, Debug)]
pub struct SigInfo {
    pub signo: u32,
    pub code: SigCode,
    /// Originator identity: sender tid, timer id or queue handle.
    pub source: u64,
    pub value: u64,
    pub overrun: u32,
}

/// Notification target registered with a timer or a message queue.
#[derive(Clone, Copy, Debug)]
pub struct SigEvent {
    /// Zero suppresses notification entirely.
    pub signo: u32,
    pub value: u64,
}

/// A pooled notification record.
pub(crate) struct SigNote {
    si: SigInfo,
}

/// The global bounded pool backing all queued notifications.
pub(crate) struct SigPool {
    records: SpinLock<Vec<SigNote>>,
}

impl SigPool {
    pub(crate) fn new() -> SigPool {
        // One slot per non-real-time number plus two per real-time
        // number, assuming one consumer thread per signal.
        let depth = NSIG + 2 * (NSIG - SIGRTMIN as usize);
        let records = (0..depth)
            .map(|_| SigNote {
                si: SigInfo {
                    signo: 0,
                    code: SigCode::Kill,
                    source: 0,
                    value: 0,
                    overrun: 0,
                },
            })
            .collect();
        SigPool {
            records: SpinLock::new(records),
        }
    }

    fn get(&self) -> Option<SigNote> {
        self.records.lock().pop()
    }

    fn put(&self, note: SigNote) {
        self.records.lock().push(note);
    }
}

/// Per-thread signal state.
pub(crate) struct SigState {
    pending: u64,
    queues: Vec<VecDeque<SigNote>>,
}

impl SigState {
    pub(crate) fn new() -> SigState {
        SigState {
            pending: 0,
            queues: (0..NSIG).map(|_| VecDeque::new()).collect(),
        }
    }
}

fn sig_bit(signo: u32) -> u64 {
    1u64 << (signo - 1)
}

fn check_signo(signo: u32) -> Result<()> {
    if signo == 0 || signo as usize > NSIG {
        return_errno!(Errno::EINVAL);
    }
    Ok(())
}

/// Delivers `si` to `thread`: coalesce, hand over directly, or queue
/// from the pool. `EAGAIN` reports pool exhaustion to the sender.
pub(crate) fn send(kernel: &Arc<Kernel>, thread: &Arc<RtThread>, si: SigInfo) -> Result<()> {
    check_signo(si.signo)?;
    let queue_index = (si.signo - 1) as usize;
    let mut sig = thread.sig().lock();

    // Same source already pending: bump the overrun count.
    for note in sig.queues[queue_index].iter_mut() {
        if note.si.code == si.code && note.si.source == si.source {
            if note.si.overrun < DELAYMAX {
                note.si.overrun += 1;
            }
            return Ok(());
        }
    }
    // Only real-time numbers pile up notifications from distinct
    // sources.
    if !sig.queues[queue_index].is_empty() && si.signo < SIGRTMIN {
        return Ok(());
    }

    // Direct hand-off to a matching signal waiter. The slot write
    // happens under the wait queue's lock, together with the match,
    // so a second sender can never clobber an unconsumed delivery.
    let mut handed = false;
    let woken = thread.sigwait().wake_matching(|set| {
        if !handed && set & sig_bit(si.signo) != 0 {
            handed = true;
            *thread.sig_slot().lock() = Some(si);
            Some(si.signo as u64)
        } else {
            None
        }
    });
    if woken > 0 {
        return Ok(());
    }

    let Some(mut note) = kernel.signal_pool().get() else {
        warn!("signal pool empty, signal {} to {} lost", si.signo, thread.name());
        return_errno!(Errno::EAGAIN);
    };
    note.si = si;
    note.si.overrun = 0;
    sig.pending |= sig_bit(si.signo);
    sig.queues[queue_index].push_back(note);
    Ok(())
}

/// Blocks until one of the signals in `set` is pending and dequeues
/// it.
pub fn wait(ctx: &Context<'_>, set: u64, deadline: Option<Nanos>) -> Result<SigInfo> {
    if set == 0 {
        return_errno!(Errno::EINVAL);
    }
    let thread = ctx.thread;
    let mut sig = thread.sig().lock();
    let hits = sig.pending & set;
    if hits != 0 {
        let signo = hits.trailing_zeros() + 1;
        let queue_index = (signo - 1) as usize;
        let note = sig.queues[queue_index]
            .pop_front()
            .expect("pending bit without a queued record");
        if sig.queues[queue_index].is_empty() {
            sig.pending &= !sig_bit(signo);
        }
        let si = note.si;
        drop(sig);
        ctx.kernel.signal_pool().put(note);
        finish_delivery(ctx, &si);
        return Ok(si);
    }

    let sleeper = thread.sigwait().prepare(set);
    drop(sig);
    let timeout = match deadline {
        None => Timeout::Never,
        Some(ns) => Timeout::At(ns),
    };
    let wakeup = sleeper.wait(timeout);
    match wakeup.status {
        WaitStatus::Woken => {
            let si = thread
                .sig_slot()
                .lock()
                .take()
                .expect("woken signal waiter without a delivery");
            finish_delivery(ctx, &si);
            Ok(si)
        }
        WaitStatus::Timedout => return_errno!(Errno::ETIMEDOUT),
        WaitStatus::Interrupted => return_errno!(Errno::EINTR),
        WaitStatus::Destroyed => return_errno!(Errno::EINVAL),
    }
}

fn finish_delivery(ctx: &Context<'_>, si: &SigInfo) {
    // Each notified timer learns how many expiries this delivery
    // folded together.
    if si.code == SigCode::Timer {
        crate::timer::notified(ctx, si);
    }
}

/// The calling thread's pending bitmap.
pub fn pending(ctx: &Context<'_>) -> u64 {
    ctx.thread.sig().lock().pending
}

/// Queues a value-carrying signal at `target`.
pub fn queue(ctx: &Context<'_>, target: &Arc<RtThread>, signo: u32, value: u64) -> Result<()> {
    let si = SigInfo {
        signo,
        code: SigCode::Queue,
        source: ctx.thread.tid(),
        value,
        overrun: 0,
    };
    send(ctx.kernel, target, si)?;
    target.nucleus().kick();
    Ok(())
}

/// Thread kill: delivers the signal and interrupts any interruptible
/// sleep, which is how host signals unblock real-time waits. A zero
/// `signo` only probes for existence.
pub fn kill(ctx: &Context<'_>, tid: u64, signo: u32) -> Result<()> {
    let Some(target) = ctx.process.thread_by_tid(tid) else {
        return_errno!(Errno::ESRCH);
    };
    if signo == 0 {
        return Ok(());
    }
    let si = SigInfo {
        signo,
        code: SigCode::Kill,
        source: ctx.thread.tid(),
        value: 0,
        overrun: 0,
    };
    // Coalescing may swallow the record; the kick is the essential
    // part.
    let _ = send(ctx.kernel, &target, si);
    target.nucleus().kick();
    Ok(())
}

/// Returns a dying thread's queued records to the pool.
pub(crate) fn flush_thread(kernel: &Arc<Kernel>, thread: &RtThread) {
    let mut sig = thread.sig().lock();
    if sig.pending == 0 {
        return;
    }
    for queue in sig.queues.iter_mut() {
        while let Some(note) = queue.pop_front() {
            kernel.signal_pool().put(note);
        }
    }
    sig.pending = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Process;
    use crate::thread::{RtThread, SchedParam};

    fn setup() -> (Arc<Kernel>, Arc<Process>, Arc<RtThread>) {
        let kernel = Kernel::new();
        let process = Process::new(&kernel);
        let thread = RtThread::attach_current(&process, "sig-main", SchedParam::fifo(1)).unwrap();
        (kernel, process, thread)
    }

    #[test]
    fn pending_signal_is_dequeued_without_sleeping() {
        let (kernel, process, thread) = setup();
        let si = SigInfo {
            signo: 5,
            code: SigCode::Queue,
            source: 42,
            value: 7,
            overrun: 0,
        };
        send(&kernel, &thread, si).unwrap();
        let ctx = crate::context::Context {
            kernel: &kernel,
            process: &process,
            thread: &thread,
        };
        assert_eq!(pending(&ctx) & sig_bit(5), sig_bit(5));
        let got = wait(&ctx, sig_bit(5), None).unwrap();
        assert_eq!(got.signo, 5);
        assert_eq!(got.value, 7);
        assert_eq!(pending(&ctx), 0);
    }

    #[test]
    fn same_source_coalesces_with_overrun() {
        let (kernel, process, thread) = setup();
        let si = SigInfo {
            signo: 20,
            code: SigCode::Timer,
            source: 3,
            value: 0,
            overrun: 0,
        };
        send(&kernel, &thread, si).unwrap();
        send(&kernel, &thread, si).unwrap();
        send(&kernel, &thread, si).unwrap();
        let ctx = crate::context::Context {
            kernel: &kernel,
            process: &process,
            thread: &thread,
        };
        let got = wait(&ctx, sig_bit(20), None).unwrap();
        assert_eq!(got.overrun, 2);
        // The coalesced record was the only one.
        assert_eq!(pending(&ctx), 0);
    }

    #[test]
    fn non_rt_numbers_do_not_pile_up() {
        let (kernel, process, thread) = setup();
        let mut si = SigInfo {
            signo: 5,
            code: SigCode::Queue,
            source: 1,
            value: 0,
            overrun: 0,
        };
        send(&kernel, &thread, si).unwrap();
        si.source = 2;
        send(&kernel, &thread, si).unwrap();
        let ctx = crate::context::Context {
            kernel: &kernel,
            process: &process,
            thread: &thread,
        };
        let first = wait(&ctx, sig_bit(5), None).unwrap();
        assert_eq!(first.source, 1);
        assert_eq!(pending(&ctx), 0);
    }

    #[test]
    fn rt_numbers_queue_per_source() {
        let (kernel, process, thread) = setup();
        let mut si = SigInfo {
            signo: SIGRTMIN,
            code: SigCode::Queue,
            source: 1,
            value: 10,
            overrun: 0,
        };
        send(&kernel, &thread, si).unwrap();
        si.source = 2;
        si.value = 20;
        send(&kernel, &thread, si).unwrap();
        let ctx = crate::context::Context {
            kernel: &kernel,
            process: &process,
            thread: &thread,
        };
        let first = wait(&ctx, sig_bit(SIGRTMIN), None).unwrap();
        let second = wait(&ctx, sig_bit(SIGRTMIN), None).unwrap();
        assert_eq!((first.value, second.value), (10, 20));
    }
}
