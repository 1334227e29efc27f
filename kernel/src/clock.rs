// SPDX-License-Identifier: MPL-2.0

//! Clock services.
//!
//! Two clocks are visible to user space: the monotonic nucleus base
//! and a wall clock expressed as a settable offset from it. Every
//! timed wait carries an absolute deadline on the clock its primitive
//! was initialized with; conversion to the monotonic base happens
//! once, on entry.

use core::sync::atomic::Ordering;

use int_to_c_enum::TryFromInt;
use nucleus::clock::{self, Nanos, Timeout};
use nucleus::sync::{Policy, WaitQueue, WaitStatus};

use crate::context::Context;
use crate::prelude::*;
use crate::process::Kernel;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromInt)]
#[repr(u32)]
pub enum ClockId {
    Realtime = 0,
    Monotonic = 1,
}

/// Current reading of `clock`.
pub fn gettime(kernel: &Kernel, clock: ClockId) -> Nanos {
    match clock {
        ClockId::Monotonic => clock::now(),
        ClockId::Realtime => {
            let offset = kernel.realtime_offset().load(Ordering::Relaxed);
            clock::now().wrapping_add(offset as Nanos)
        }
    }
}

/// Adjusts the wall clock. The monotonic clock cannot be set.
pub fn settime(kernel: &Kernel, clock: ClockId, time: Nanos) -> Result<()> {
    match clock {
        ClockId::Monotonic => {
            return_errno_with_message!(Errno::EINVAL, "the monotonic clock cannot be set")
        }
        ClockId::Realtime => {
            let offset = time.wrapping_sub(clock::now()) as i64;
            kernel.realtime_offset().store(offset, Ordering::Relaxed);
            Ok(())
        }
    }
}

/// Resolution of either clock, in nanoseconds.
pub fn getres(_clock: ClockId) -> Nanos {
    1
}

/// Converts an absolute deadline on `clock` to a nucleus timeout.
pub fn to_timeout(kernel: &Kernel, clock: ClockId, deadline: Nanos) -> Timeout {
    match clock {
        ClockId::Monotonic => Timeout::At(deadline),
        ClockId::Realtime => {
            let offset = kernel.realtime_offset().load(Ordering::Relaxed);
            Timeout::At(deadline.wrapping_sub(offset as Nanos))
        }
    }
}

/// Suspends the caller until the absolute `deadline` on `clock`.
///
/// A host signal interrupts the sleep with `EINTR`; reaching the
/// deadline is the success case.
pub fn nanosleep(ctx: &Context<'_>, clock: ClockId, deadline: Nanos) -> Result<()> {
    let timeout = to_timeout(ctx.kernel, clock, deadline);
    // A private queue nobody ever signals: only the deadline or a
    // kick can end this sleep.
    let bed = WaitQueue::new(Policy::Fifo);
    match bed.sleep_on(timeout, 0).status {
        WaitStatus::Timedout => Ok(()),
        WaitStatus::Interrupted => return_errno!(Errno::EINTR),
        _ => return_errno!(Errno::EINVAL),
    }
}
