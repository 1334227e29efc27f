// SPDX-License-Identifier: MPL-2.0

//! Monotonic time base shared by every timed service.

use core::time::Duration;
use std::time::Instant;

use spin::Lazy;

/// Nanoseconds on the nucleus monotonic clock.
pub type Nanos = u64;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Returns the current time on the monotonic base.
///
/// The base starts at an arbitrary point before the first caller
/// observes it; only differences are meaningful.
pub fn now() -> Nanos {
    EPOCH.elapsed().as_nanos() as Nanos
}

/// Expiry specification for a blocking service.
///
/// All deadlines are absolute on the monotonic base; callers working
/// on another clock convert before sleeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Sleep until explicitly woken.
    Never,
    /// Sleep until the deadline, then report a timeout.
    At(Nanos),
}

impl Timeout {
    /// Absolute deadline for a relative delay from now.
    pub fn after(delay: Duration) -> Self {
        Timeout::At(now().saturating_add(delay.as_nanos() as Nanos))
    }

    /// Whether the deadline has already passed.
    pub fn is_elapsed(&self) -> bool {
        match *self {
            Timeout::Never => false,
            Timeout::At(deadline) => now() >= deadline,
        }
    }

    /// Time left before expiry, `None` for an unbounded sleep.
    pub fn remaining(&self) -> Option<Duration> {
        match *self {
            Timeout::Never => None,
            Timeout::At(deadline) => Some(Duration::from_nanos(deadline.saturating_sub(now()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_goes_backwards() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn timeout_elapses() {
        assert!(!Timeout::Never.is_elapsed());
        assert!(Timeout::At(0).is_elapsed());
        let later = Timeout::after(Duration::from_secs(3600));
        assert!(!later.is_elapsed());
        assert!(later.remaining().unwrap() > Duration::from_secs(3599));
    }
}
