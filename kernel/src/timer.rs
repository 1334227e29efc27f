// SPDX-License-Identifier: MPL-2.0

//! Interval timers.
//!
//! Timer ids come from a per-process bitmap; each id binds a nucleus
//! timer whose expiry enqueues a signal notification at the target
//! thread. Expiries the consumer has not collected yet fold into an
//! overrun count instead of queueing further records; the count of
//! the last collected delivery is what `getoverrun` reports.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use nucleus::clock::{self as nclock, Nanos};
use nucleus::timer::Timer;

use crate::clock::{self, ClockId};
use crate::config::{DELAYMAX, SIGALRM};
use crate::context::Context;
use crate::prelude::*;
use crate::signal::{self, SigCode, SigEvent, SigInfo};
use crate::thread::RtThread;

pub struct ProcTimer {
    id: usize,
    clock: ClockId,
    signo: u32,
    value: u64,
    target: Weak<RtThread>,
    nucleus: Timer,
    /// Expiries folded into the next delivery.
    pending_overruns: AtomicU32,
    undelivered: AtomicBool,
    /// Overruns of the last collected delivery.
    reported: AtomicU32,
}

impl ProcTimer {
    pub(crate) fn shutdown(&self) {
        self.nucleus.stop();
    }
}

/// Creates a timer on `clock` delivering through the signal queue of
/// `target_tid` (the caller by default). Passing an event with a zero
/// signal number creates a silent timer.
pub fn create(
    ctx: &Context<'_>,
    clock: ClockId,
    event: Option<SigEvent>,
    target_tid: Option<u64>,
) -> Result<usize> {
    let target = match target_tid {
        None => ctx.thread.clone(),
        Some(tid) => ctx
            .process
            .thread_by_tid(tid)
            .ok_or_else(|| Error::with_message(Errno::EINVAL, "notify target not found"))?,
    };
    let mut timers = ctx.process.timers.lock();
    let id = timers.alloc_id()?;
    let (signo, value) = match event {
        None => (SIGALRM, id as u64),
        Some(event) => (event.signo, event.value),
    };

    let kernel = Arc::downgrade(ctx.kernel);
    let weak_target = Arc::downgrade(&target);
    let timer = Arc::new_cyclic(|self_ref: &Weak<ProcTimer>| {
        let hook = self_ref.clone();
        let handler = Box::new(move |missed: u64| {
            let (Some(timer), Some(kernel)) = (hook.upgrade(), kernel.upgrade()) else {
                return;
            };
            timer.expire(&kernel, missed);
        });
        ProcTimer {
            id,
            clock,
            signo,
            value,
            target: weak_target,
            nucleus: ctx.kernel.wheel().create_timer(handler),
            pending_overruns: AtomicU32::new(0),
            undelivered: AtomicBool::new(false),
            reported: AtomicU32::new(0),
        }
    });
    timers.install(id, timer);
    Ok(id)
}

impl ProcTimer {
    fn expire(self: &Arc<ProcTimer>, kernel: &Arc<crate::process::Kernel>, missed: u64) {
        let folded = missed.min(DELAYMAX as u64) as u32;
        if self.undelivered.swap(true, Ordering::AcqRel) {
            // The previous expiry is still waiting to be collected.
            let bump = 1 + folded;
            let prev = self.pending_overruns.load(Ordering::Relaxed);
            self.pending_overruns
                .store(prev.saturating_add(bump).min(DELAYMAX), Ordering::Relaxed);
        } else {
            self.pending_overruns.store(folded, Ordering::Relaxed);
        }
        if self.signo == 0 {
            // Silent timer; overruns still accrue for getoverrun.
            return;
        }
        let Some(target) = self.target.upgrade() else {
            // The notification target is gone; stop ticking. The id
            // is reclaimed by timer_delete or process teardown.
            self.nucleus.stop();
            return;
        };
        let si = SigInfo {
            signo: self.signo,
            code: SigCode::Timer,
            source: self.id as u64,
            value: self.value,
            overrun: 0,
        };
        let _ = signal::send(kernel, &target, si);
    }
}

fn by_id(ctx: &Context<'_>, id: usize) -> Result<Arc<ProcTimer>> {
    ctx.process
        .timers
        .lock()
        .get(id)
        .ok_or_else(|| Error::with_message(Errno::EINVAL, "no such timer"))
}

/// Arms the timer. A zero `value` disarms it. Returns the previous
/// (remaining, interval) pair.
pub fn settime(
    ctx: &Context<'_>,
    id: usize,
    absolute: bool,
    value: Nanos,
    interval: Nanos,
) -> Result<(Nanos, Nanos)> {
    let timer = by_id(ctx, id)?;
    let old = read_time(&timer);
    if value == 0 {
        timer.nucleus.stop();
        timer.undelivered.store(false, Ordering::Release);
        return Ok(old);
    }
    let expiry = if absolute {
        match clock::to_timeout(ctx.kernel, timer.clock, value) {
            nucleus::clock::Timeout::At(ns) => ns,
            nucleus::clock::Timeout::Never => unreachable!(),
        }
    } else {
        nclock::now().saturating_add(value)
    };
    let period = (interval > 0).then_some(interval);
    timer.undelivered.store(false, Ordering::Release);
    timer.pending_overruns.store(0, Ordering::Release);
    timer.nucleus.start(expiry, period);
    Ok(old)
}

fn read_time(timer: &ProcTimer) -> (Nanos, Nanos) {
    let (remaining, period) = timer.nucleus.gettime();
    (remaining.unwrap_or(0), period.unwrap_or(0))
}

/// Remaining time to the next expiry and the interval; both zero for
/// a disarmed timer.
pub fn gettime(ctx: &Context<'_>, id: usize) -> Result<(Nanos, Nanos)> {
    let timer = by_id(ctx, id)?;
    Ok(read_time(&timer))
}

/// Overrun count of the last collected expiry, capped at the delay
/// maximum.
pub fn getoverrun(ctx: &Context<'_>, id: usize) -> Result<u32> {
    let timer = by_id(ctx, id)?;
    Ok(timer.reported.load(Ordering::Acquire).min(DELAYMAX))
}

pub fn delete(ctx: &Context<'_>, id: usize) -> Result<()> {
    let timer = by_id(ctx, id)?;
    timer.shutdown();
    ctx.process.timers.lock().free_id(id);
    Ok(())
}

/// Delivery hook run when a signal wait collects a timer
/// notification: publishes the folded overruns to `getoverrun`.
///
/// The timer's own count is authoritative; the record's coalesce
/// counter tracks the same suppressed expiries and is ignored here.
pub(crate) fn notified(ctx: &Context<'_>, si: &SigInfo) {
    let Some(timer) = ctx.process.timers.lock().get(si.source as usize) else {
        return;
    };
    let folded = timer.pending_overruns.swap(0, Ordering::AcqRel);
    timer.undelivered.store(false, Ordering::Release);
    timer.reported.store(folded.min(DELAYMAX), Ordering::Release);
}
