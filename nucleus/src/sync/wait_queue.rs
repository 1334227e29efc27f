// SPDX-License-Identifier: MPL-2.0

//! Wait queues.
//!
//! A [`WaitQueue`] is the suspension point every blocking service
//! sleeps on. Waiters enqueue with a split prepare/wait protocol so a
//! caller can publish itself on the queue, release another resource,
//! and only then commit to sleeping; a wakeup arriving in the window
//! is never lost. Wakers may hand a one-word payload directly to the
//! waiter they unblock, which is how pipelined message delivery,
//! event satisfaction masks and direct signal hand-off work.

use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use spin::Mutex as SpinLock;

use crate::clock::Timeout;
use crate::thread::Thread;

/// Wakeup ordering among sleepers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    /// Strict insertion order.
    Fifo,
    /// Effective priority descending, insertion order within a tie.
    Prio,
}

/// Why a sleeper resumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    /// Woken by the primitive's own protocol.
    Woken,
    /// Interrupted by a host signal.
    Interrupted,
    /// The absolute deadline passed.
    Timedout,
    /// The object was destroyed while the caller slept.
    Destroyed,
}

/// Abnormal status applied to every waiter by [`WaitQueue::flush`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushKind {
    Interrupt,
    Destroy,
}

/// Outcome of one sleep, with the payload the waker handed over.
#[derive(Clone, Copy, Debug)]
pub struct Wakeup {
    pub status: WaitStatus,
    pub payload: Option<u64>,
}

const WAITING: u8 = 0;
const WOKEN: u8 = 1;

const ST_WOKEN: u8 = 0;
const ST_INTERRUPTED: u8 = 1;
const ST_TIMEDOUT: u8 = 2;
const ST_DESTROYED: u8 = 3;

pub struct WaitNode {
    thread: Arc<Thread>,
    host: std::thread::Thread,
    prio: i32,
    seq: u64,
    tag: u64,
    // `state` only transitions under the owning queue's lock; the
    // park loop reads it lock-free.
    state: AtomicU8,
    status: AtomicU8,
    payload: AtomicU64,
    has_payload: AtomicU8,
    queue: Weak<SpinLock<Inner>>,
}

impl WaitNode {
    /// Interrupts this waiter if it is still pending. Reached through
    /// the thread's current-wait binding by [`Thread::kick`].
    pub(crate) fn interrupt(&self) {
        let Some(inner) = self.queue.upgrade() else {
            return;
        };
        let mut guard = inner.lock();
        if self.state.load(Ordering::Acquire) != WAITING {
            return;
        }
        guard.remove_ptr(self);
        self.status.store(ST_INTERRUPTED, Ordering::Relaxed);
        self.state.store(WOKEN, Ordering::Release);
        drop(guard);
        self.host.unpark();
    }

    fn wakeup(&self) -> Wakeup {
        let status = match self.status.load(Ordering::Relaxed) {
            ST_WOKEN => WaitStatus::Woken,
            ST_INTERRUPTED => WaitStatus::Interrupted,
            ST_TIMEDOUT => WaitStatus::Timedout,
            _ => WaitStatus::Destroyed,
        };
        let payload = (self.has_payload.load(Ordering::Acquire) != 0)
            .then(|| self.payload.load(Ordering::Acquire));
        Wakeup { status, payload }
    }
}

struct Inner {
    waiters: Vec<Arc<WaitNode>>,
    next_seq: u64,
}

impl Inner {
    fn remove_ptr(&mut self, node: &WaitNode) {
        self.waiters
            .retain(|candidate| !core::ptr::eq(candidate.as_ref(), node));
    }

    /// Index of the next waiter to wake under `policy`.
    fn pick(&self, policy: Policy) -> Option<usize> {
        match policy {
            Policy::Fifo => self
                .waiters
                .iter()
                .enumerate()
                .min_by_key(|(_, node)| node.seq)
                .map(|(index, _)| index),
            Policy::Prio => self
                .waiters
                .iter()
                .enumerate()
                .max_by_key(|(_, node)| (node.prio, u64::MAX - node.seq))
                .map(|(index, _)| index),
        }
    }

    fn sorted(&self, policy: Policy) -> Vec<Arc<WaitNode>> {
        let mut nodes = self.waiters.clone();
        match policy {
            Policy::Fifo => nodes.sort_by_key(|node| node.seq),
            Policy::Prio => nodes.sort_by_key(|node| (core::cmp::Reverse(node.prio), node.seq)),
        }
        nodes
    }
}

pub struct WaitQueue {
    policy: Policy,
    inner: Arc<SpinLock<Inner>>,
}

/// A waiter published on a queue but not yet committed to sleeping.
///
/// Dropping the sleeper without waiting withdraws the registration.
pub struct Sleeper<'a> {
    queue: &'a WaitQueue,
    node: Arc<WaitNode>,
}

impl WaitQueue {
    pub fn new(policy: Policy) -> Self {
        WaitQueue {
            policy,
            inner: Arc::new(SpinLock::new(Inner {
                waiters: Vec::new(),
                next_seq: 0,
            })),
        }
    }

    /// Publishes the calling thread on the queue. `tag` is the
    /// waiter's predicate data, consulted by [`Self::wake_matching`].
    pub fn prepare(&self, tag: u64) -> Sleeper<'_> {
        let thread = Thread::current();
        let mut inner = self.inner.lock();
        let node = Arc::new(WaitNode {
            prio: thread.effective_priority(),
            seq: inner.next_seq,
            tag,
            host: std::thread::current(),
            state: AtomicU8::new(WAITING),
            status: AtomicU8::new(ST_WOKEN),
            payload: AtomicU64::new(0),
            has_payload: AtomicU8::new(0),
            queue: Arc::downgrade(&self.inner),
            thread,
        });
        inner.next_seq += 1;
        node.thread.bind_wait(node.clone());
        inner.waiters.push(node.clone());
        drop(inner);
        Sleeper { queue: self, node }
    }

    /// Prepares and immediately waits.
    pub fn sleep_on(&self, timeout: Timeout, tag: u64) -> Wakeup {
        self.prepare(tag).wait(timeout)
    }

    /// Wakes the best waiter under the queue policy.
    pub fn wake_one(&self) -> Option<Arc<Thread>> {
        self.wake_one_inner(None, |_, _| {})
    }

    /// Wakes the best waiter, handing it `payload`.
    pub fn wake_one_with(&self, payload: u64) -> Option<Arc<Thread>> {
        self.wake_one_inner(Some(payload), |_, _| {})
    }

    /// Wakes the best waiter after running `transfer` under the queue
    /// lock with the chosen thread and the count of waiters left
    /// behind. Owned queues use this to move ownership atomically so
    /// no third party can slip in ahead of the woken waiter.
    pub fn wake_one_transfer(
        &self,
        transfer: impl FnOnce(&Arc<Thread>, usize),
    ) -> Option<Arc<Thread>> {
        self.wake_one_inner(None, transfer)
    }

    fn wake_one_inner(
        &self,
        payload: Option<u64>,
        transfer: impl FnOnce(&Arc<Thread>, usize),
    ) -> Option<Arc<Thread>> {
        let mut inner = self.inner.lock();
        let index = inner.pick(self.policy)?;
        let node = inner.waiters.swap_remove(index);
        if let Some(payload) = payload {
            node.payload.store(payload, Ordering::Release);
            node.has_payload.store(1, Ordering::Release);
        }
        transfer(&node.thread, inner.waiters.len());
        node.status.store(ST_WOKEN, Ordering::Relaxed);
        node.state.store(WOKEN, Ordering::Release);
        drop(inner);
        node.host.unpark();
        Some(node.thread.clone())
    }

    /// Wakes every waiter with a normal status, e.g. for broadcast
    /// semantics. Returns how many were woken.
    pub fn wake_all(&self) -> usize {
        let mut woken = 0;
        while self.wake_one().is_some() {
            woken += 1;
        }
        woken
    }

    /// Wakes each waiter whose tag satisfies `matcher`, delivering the
    /// payload the matcher computes. Returns how many were woken.
    pub fn wake_matching(&self, mut matcher: impl FnMut(u64) -> Option<u64>) -> usize {
        let mut inner = self.inner.lock();
        let candidates = inner.sorted(self.policy);
        let mut woken = Vec::new();
        for node in candidates {
            if let Some(payload) = matcher(node.tag) {
                inner.remove_ptr(&node);
                node.payload.store(payload, Ordering::Release);
                node.has_payload.store(1, Ordering::Release);
                node.status.store(ST_WOKEN, Ordering::Relaxed);
                node.state.store(WOKEN, Ordering::Release);
                woken.push(node);
            }
        }
        drop(inner);
        for node in &woken {
            node.host.unpark();
        }
        woken.len()
    }

    /// Unblocks every waiter with the abnormal status for `kind`.
    /// Returns whether any waiter was flushed.
    pub fn flush(&self, kind: FlushKind) -> bool {
        let status = match kind {
            FlushKind::Interrupt => ST_INTERRUPTED,
            FlushKind::Destroy => ST_DESTROYED,
        };
        let mut inner = self.inner.lock();
        let drained: Vec<_> = inner.waiters.drain(..).collect();
        for node in &drained {
            node.status.store(status, Ordering::Relaxed);
            node.state.store(WOKEN, Ordering::Release);
        }
        drop(inner);
        for node in &drained {
            node.host.unpark();
        }
        !drained.is_empty()
    }

    /// Count of threads currently published on the queue.
    pub fn count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Highest effective priority among the waiters.
    pub fn top_priority(&self) -> Option<i32> {
        self.inner
            .lock()
            .waiters
            .iter()
            .map(|node| node.prio)
            .max()
    }

    /// Waiting threads in wakeup order, for inquiry services.
    pub fn waiter_threads(&self) -> Vec<Arc<Thread>> {
        self.inner
            .lock()
            .sorted(self.policy)
            .into_iter()
            .map(|node| node.thread.clone())
            .collect()
    }
}

impl Sleeper<'_> {
    /// Commits to sleeping until woken, interrupted or timed out.
    pub fn wait(self, timeout: Timeout) -> Wakeup {
        loop {
            if self.node.state.load(Ordering::Acquire) == WOKEN {
                break;
            }
            match timeout.remaining() {
                None => std::thread::park(),
                Some(left) if left.is_zero() => {
                    let mut inner = self.queue.inner.lock();
                    if self.node.state.load(Ordering::Acquire) == WOKEN {
                        break;
                    }
                    inner.remove_ptr(&self.node);
                    self.node.status.store(ST_TIMEDOUT, Ordering::Relaxed);
                    self.node.state.store(WOKEN, Ordering::Release);
                    break;
                }
                Some(left) => std::thread::park_timeout(left),
            }
        }
        self.node.thread.unbind_wait(&self.node);
        self.node.wakeup()
    }

    /// The thread published by this sleeper.
    pub fn thread(&self) -> &Arc<Thread> {
        &self.node.thread
    }
}

impl Drop for Sleeper<'_> {
    fn drop(&mut self) {
        let mut inner = self.queue.inner.lock();
        if self.node.state.load(Ordering::Acquire) == WAITING {
            inner.remove_ptr(&self.node);
            self.node.state.store(WOKEN, Ordering::Release);
        }
        drop(inner);
        self.node.thread.unbind_wait(&self.node);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;
    use crate::clock;

    #[test]
    fn wake_order_follows_priority() {
        let queue = Arc::new(WaitQueue::new(Policy::Prio));
        let order = Arc::new(SpinLock::new(Vec::new()));
        let mut spawned = Vec::new();
        for prio in [1, 3, 2] {
            let queue = queue.clone();
            let order = order.clone();
            spawned.push(
                Thread::spawn(&format!("w{prio}"), prio, move || {
                    let wakeup = queue.sleep_on(Timeout::Never, 0);
                    assert_eq!(wakeup.status, WaitStatus::Woken);
                    order.lock().push(prio);
                })
                .unwrap(),
            );
        }
        while queue.count() < 3 {
            std::thread::yield_now();
        }
        while queue.wake_one().is_some() {}
        for s in spawned {
            s.join();
        }
        assert_eq!(*order.lock(), vec![3, 2, 1]);
    }

    #[test]
    fn fifo_order_is_insertion_order() {
        let queue = Arc::new(WaitQueue::new(Policy::Fifo));
        let order = Arc::new(SpinLock::new(Vec::new()));
        let mut spawned = Vec::new();
        for id in 0..3 {
            let thread_queue = queue.clone();
            let order = order.clone();
            spawned.push(
                Thread::spawn(&format!("f{id}"), 9 - id, move || {
                    let wakeup = thread_queue.sleep_on(Timeout::Never, 0);
                    assert_eq!(wakeup.status, WaitStatus::Woken);
                    order.lock().push(id);
                })
                .unwrap(),
            );
            while queue.count() != (id + 1) as usize {
                std::thread::yield_now();
            }
        }
        queue.wake_all();
        for s in spawned {
            s.join();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn timeout_reports_timedout() {
        let queue = WaitQueue::new(Policy::Prio);
        let deadline = Timeout::At(clock::now() + 20_000_000);
        let wakeup = queue.sleep_on(deadline, 0);
        assert_eq!(wakeup.status, WaitStatus::Timedout);
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn kick_interrupts_a_sleeper() {
        let queue = Arc::new(WaitQueue::new(Policy::Prio));
        let q = queue.clone();
        let sleeper = Thread::spawn("victim", 1, move || {
            let wakeup = q.sleep_on(Timeout::Never, 0);
            assert_eq!(wakeup.status, WaitStatus::Interrupted);
        })
        .unwrap();
        while queue.count() == 0 {
            std::thread::yield_now();
        }
        sleeper.thread().kick();
        sleeper.join();
    }

    #[test]
    fn prepared_waiter_sees_wake_before_commit() {
        let queue = Arc::new(WaitQueue::new(Policy::Prio));
        let q = queue.clone();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let waiter = Thread::spawn("early", 1, move || {
            let sleeper = q.prepare(0);
            // The wake lands while we are still between prepare and
            // wait; it must not be lost.
            while q.count() > 0 {
                std::thread::yield_now();
            }
            let wakeup = sleeper.wait(Timeout::Never);
            assert_eq!(wakeup.status, WaitStatus::Woken);
            h.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        while queue.wake_one().is_none() {
            std::thread::yield_now();
        }
        waiter.join();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn payload_rides_along() {
        let queue = Arc::new(WaitQueue::new(Policy::Prio));
        let q = queue.clone();
        let waiter = Thread::spawn("rx", 1, move || {
            let wakeup = q.sleep_on(Timeout::Never, 0);
            assert_eq!(wakeup.payload, Some(0xfeed));
        })
        .unwrap();
        while queue.count() == 0 {
            std::thread::yield_now();
        }
        queue.wake_one_with(0xfeed);
        waiter.join();
    }

    #[test]
    fn flush_reports_destroyed() {
        let queue = Arc::new(WaitQueue::new(Policy::Prio));
        let q = queue.clone();
        let waiter = Thread::spawn("doomed", 1, move || {
            let wakeup = q.sleep_on(Timeout::Never, 0);
            assert_eq!(wakeup.status, WaitStatus::Destroyed);
        })
        .unwrap();
        while queue.count() == 0 {
            std::thread::yield_now();
        }
        assert!(queue.flush(FlushKind::Destroy));
        assert!(!queue.flush(FlushKind::Destroy));
        waiter.join();
    }

    #[test]
    fn wake_matching_delivers_computed_payloads() {
        let queue = Arc::new(WaitQueue::new(Policy::Prio));
        let mut spawned = Vec::new();
        for tag in [0b01u64, 0b10, 0b100] {
            let q = queue.clone();
            spawned.push(
                Thread::spawn("m", 1, move || {
                    let wakeup = q.sleep_on(Timeout::Never, tag);
                    match wakeup.status {
                        WaitStatus::Woken => assert_eq!(wakeup.payload, Some(tag)),
                        WaitStatus::Interrupted => assert_eq!(tag, 0b100),
                        other => panic!("unexpected status {other:?}"),
                    }
                })
                .unwrap(),
            );
        }
        while queue.count() < 3 {
            std::thread::yield_now();
        }
        let woken = queue.wake_matching(|tag| (tag & 0b11 != 0).then_some(tag));
        assert_eq!(woken, 2);
        assert_eq!(queue.count(), 1);
        queue.flush(FlushKind::Interrupt);
        for s in spawned {
            s.join();
        }
    }
}
