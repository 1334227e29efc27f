// SPDX-License-Identifier: MPL-2.0

//! Timer wheel.
//!
//! One dedicated expiry thread per wheel sleeps until the earliest
//! armed deadline and runs the due handlers. Periodic timers re-arm
//! themselves on their original phase; expiries the consumer missed
//! are folded into an overrun count handed to the handler instead of
//! firing back-to-back.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use spin::Mutex as SpinLock;

use crate::clock::{self, Nanos, Timeout};
use crate::sync::{Policy, WaitQueue};
use crate::thread::Thread;

type Handler = Box<dyn Fn(u64) + Send + Sync>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

struct WheelShared {
    armed: SpinLock<BTreeMap<(Nanos, u64), Arc<TimerInner>>>,
    doorbell: WaitQueue,
    stop: AtomicBool,
}

struct TimerInner {
    id: u64,
    handler: Handler,
    state: SpinLock<TimerState>,
}

#[derive(Default)]
struct TimerState {
    /// Key under which the timer sits in the wheel, when armed.
    key: Option<(Nanos, u64)>,
    period: Option<Nanos>,
}

/// A timer bound to a wheel. Stopped when dropped.
pub struct Timer {
    wheel: Weak<WheelShared>,
    inner: Arc<TimerInner>,
}

pub struct TimerWheel {
    shared: Arc<WheelShared>,
    join: SpinLock<Option<std::thread::JoinHandle<()>>>,
}

impl TimerWheel {
    pub fn new() -> Self {
        let shared = Arc::new(WheelShared {
            armed: SpinLock::new(BTreeMap::new()),
            doorbell: WaitQueue::new(Policy::Fifo),
            stop: AtomicBool::new(false),
        });
        let worker = shared.clone();
        let spawned = Thread::spawn("timer-wheel", i32::MAX, move || wheel_loop(worker))
            .expect("failed to start the timer wheel");
        let (_, join) = spawned.into_parts();
        TimerWheel {
            shared,
            join: SpinLock::new(Some(join)),
        }
    }

    /// Creates an unarmed timer firing `handler` on expiry. The
    /// handler receives the count of overruns folded into the tick.
    pub fn create_timer(&self, handler: Handler) -> Timer {
        Timer {
            wheel: Arc::downgrade(&self.shared),
            inner: Arc::new(TimerInner {
                id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
                handler,
                state: SpinLock::new(TimerState::default()),
            }),
        }
    }

    fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.doorbell.wake_all();
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Timer {
    /// Arms the timer for an absolute expiry, optionally periodic.
    /// Re-arming an armed timer reprograms it.
    pub fn start(&self, expiry: Nanos, period: Option<Nanos>) {
        let Some(wheel) = self.wheel.upgrade() else {
            return;
        };
        let mut armed = wheel.armed.lock();
        let mut state = self.inner.state.lock();
        if let Some(key) = state.key.take() {
            armed.remove(&key);
        }
        let key = (expiry, self.inner.id);
        state.key = Some(key);
        state.period = period;
        armed.insert(key, self.inner.clone());
        drop(state);
        drop(armed);
        wheel.doorbell.wake_all();
    }

    /// Disarms the timer. Idempotent.
    pub fn stop(&self) {
        let Some(wheel) = self.wheel.upgrade() else {
            return;
        };
        let mut armed = wheel.armed.lock();
        let mut state = self.inner.state.lock();
        if let Some(key) = state.key.take() {
            armed.remove(&key);
        }
        state.period = None;
    }

    /// Remaining time to the next expiry and the period, when armed.
    pub fn gettime(&self) -> (Option<Nanos>, Option<Nanos>) {
        let state = self.inner.state.lock();
        let remaining = state
            .key
            .map(|(expiry, _)| expiry.saturating_sub(clock::now()));
        (remaining, state.period)
    }

    pub fn is_armed(&self) -> bool {
        self.inner.state.lock().key.is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn wheel_loop(shared: Arc<WheelShared>) {
    loop {
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
        // Publish on the doorbell before reading the program so a
        // concurrent re-arm is guaranteed to either be observed here
        // or to find us registered and ring through.
        let sleeper = shared.doorbell.prepare(0);
        let next = shared.armed.lock().keys().next().copied();
        let timeout = match next {
            Some((deadline, _)) => Timeout::At(deadline),
            None => Timeout::Never,
        };
        let _ = sleeper.wait(timeout);

        loop {
            let now = clock::now();
            let due = {
                let mut armed = shared.armed.lock();
                match armed.keys().next().copied() {
                    Some(key) if key.0 <= now => armed.remove(&key).map(|t| (key, t)),
                    _ => None,
                }
            };
            let Some(((scheduled, _), timer)) = due else {
                break;
            };
            fire(&shared, timer, scheduled, now);
        }
    }
}

fn fire(shared: &Arc<WheelShared>, timer: Arc<TimerInner>, scheduled: Nanos, now: Nanos) {
    let overruns;
    {
        let mut armed = shared.armed.lock();
        let mut state = timer.state.lock();
        state.key = None;
        match state.period {
            Some(period) if period > 0 => {
                let missed = now.saturating_sub(scheduled) / period;
                overruns = missed;
                let key = (scheduled + (missed + 1) * period, timer.id);
                state.key = Some(key);
                armed.insert(key, timer.clone());
            }
            _ => overruns = 0,
        }
    }
    (timer.handler)(overruns);
}
