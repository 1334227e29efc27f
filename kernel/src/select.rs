// SPDX-License-Identifier: MPL-2.0

//! Readiness multiplexing.
//!
//! Primitives that feed a `select`-style wait expose [`SelectSink`]s
//! (a message queue has one for readability, one for writability).
//! A selector binds to the sinks it watches, sleeps, and is rung
//! whenever a sink's state flips to ready. Scanning is level
//! triggered: the selector re-reads every bound sink after each
//! wakeup, so a transition landing between scan and sleep is never
//! lost.

use nucleus::clock::Timeout;
use nucleus::sync::wait_queue::WaitStatus;
use nucleus::sync::{Policy, WaitQueue};

use crate::prelude::*;

struct SinkInner {
    ready: bool,
    watchers: Vec<Weak<WaitQueue>>,
}

/// A readiness source.
pub struct SelectSink {
    inner: SpinLock<SinkInner>,
}

impl SelectSink {
    pub fn new(ready: bool) -> Self {
        SelectSink {
            inner: SpinLock::new(SinkInner {
                ready,
                watchers: Vec::new(),
            }),
        }
    }

    /// Publishes the new state, ringing the bound selectors on the
    /// not-ready to ready edge.
    pub fn signal(&self, ready: bool) {
        let mut inner = self.inner.lock();
        let edge = ready && !inner.ready;
        inner.ready = ready;
        if !edge {
            return;
        }
        inner.watchers.retain(|watcher| watcher.upgrade().is_some());
        let watchers: Vec<_> = inner.watchers.iter().filter_map(Weak::upgrade).collect();
        drop(inner);
        for doorbell in watchers {
            doorbell.wake_all();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    fn watch(&self, doorbell: &Arc<WaitQueue>) {
        self.inner.lock().watchers.push(Arc::downgrade(doorbell));
    }

    fn unwatch(&self, doorbell: &Arc<WaitQueue>) {
        self.inner
            .lock()
            .watchers
            .retain(|watcher| !watcher.ptr_eq(&Arc::downgrade(doorbell)));
    }
}

/// One multiplexed wait over a set of sinks.
pub struct Selector {
    doorbell: Arc<WaitQueue>,
}

impl Selector {
    pub fn new() -> Self {
        Selector {
            doorbell: Arc::new(WaitQueue::new(Policy::Fifo)),
        }
    }

    /// Sleeps until at least one of `sinks` is ready or the timeout
    /// expires; returns the indices of the ready sinks.
    pub fn select(&self, sinks: &[&SelectSink], timeout: Timeout) -> Result<Vec<usize>> {
        for sink in sinks {
            sink.watch(&self.doorbell);
        }
        let result = self.select_bound(sinks, timeout);
        for sink in sinks {
            sink.unwatch(&self.doorbell);
        }
        result
    }

    fn select_bound(&self, sinks: &[&SelectSink], timeout: Timeout) -> Result<Vec<usize>> {
        loop {
            // Publish before scanning so an edge arriving after the
            // scan still rings through.
            let sleeper = self.doorbell.prepare(0);
            let ready: Vec<usize> = sinks
                .iter()
                .enumerate()
                .filter(|(_, sink)| sink.is_ready())
                .map(|(index, _)| index)
                .collect();
            if !ready.is_empty() {
                return Ok(ready);
            }
            let wakeup = sleeper.wait(timeout);
            match wakeup.status {
                WaitStatus::Woken => continue,
                WaitStatus::Timedout => return Ok(Vec::new()),
                WaitStatus::Interrupted => return_errno!(Errno::EINTR),
                WaitStatus::Destroyed => return_errno!(Errno::EINVAL),
            }
        }
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_rings_a_parked_selector() {
        let sink = Arc::new(SelectSink::new(false));
        let remote = sink.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(core::time::Duration::from_millis(20));
            remote.signal(true);
        });
        let selector = Selector::new();
        let ready = selector.select(&[&sink], Timeout::Never).unwrap();
        assert_eq!(ready, vec![0]);
        waker.join().unwrap();
    }

    #[test]
    fn level_state_returns_immediately() {
        let sink = SelectSink::new(true);
        let other = SelectSink::new(false);
        let selector = Selector::new();
        let ready = selector
            .select(&[&other, &sink], Timeout::Never)
            .unwrap();
        assert_eq!(ready, vec![1]);
    }

    #[test]
    fn timeout_returns_empty_set() {
        let sink = SelectSink::new(false);
        let selector = Selector::new();
        let deadline = Timeout::At(nucleus::clock::now() + 10_000_000);
        let ready = selector.select(&[&sink], deadline).unwrap();
        assert!(ready.is_empty());
    }
}
