// SPDX-License-Identifier: MPL-2.0

//! Ownership-aware wait queues.
//!
//! An [`OwnedQueue`] backs every fastlock-protected primitive (mutex,
//! monitor gate). It serializes the kernel half of the fastlock
//! protocol: contended acquisition, atomic ownership hand-off on
//! release, and priority inheritance boosting computed transitively
//! across blocked-owner chains.
//!
//! The fastlock word itself lives in the arena and is passed into
//! each operation; the uncontended user-space transitions never reach
//! this module.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use spin::Mutex as SpinLock;

use crate::clock::Timeout;
use crate::sync::fastlock;
use crate::sync::wait_queue::{FlushKind, Policy, WaitQueue, WaitStatus};
use crate::thread::Thread;

/// Longest owner chain a boost propagates across.
const MAX_PI_CHAIN: usize = 8;

pub struct OwnedShared {
    pi: bool,
    queue: WaitQueue,
    owner: SpinLock<Option<Arc<Thread>>>,
}

pub struct OwnedQueue {
    shared: Arc<OwnedShared>,
}

/// Resolves a fastlock owner handle to its control block. Supplied by
/// the personality layer, which owns the handle registry.
pub type OwnerResolver<'a> = &'a dyn Fn(u32) -> Option<Arc<Thread>>;

fn boost_key(shared: &Arc<OwnedShared>) -> usize {
    Arc::as_ptr(shared) as usize
}

/// Recomputes the boost this queue contributes to its owner and
/// propagates any change across the blocked-owner chain.
fn rebalance_chain(shared: &Arc<OwnedShared>) {
    let mut queue = shared.clone();
    for _ in 0..MAX_PI_CHAIN {
        if !queue.pi {
            return;
        }
        let owner = queue.owner.lock().clone();
        let Some(owner) = owner else {
            return;
        };
        let changed = match queue.queue.top_priority() {
            Some(top) => owner.add_boost(boost_key(&queue), top),
            None => owner.drop_boost(boost_key(&queue)),
        };
        if !changed {
            return;
        }
        log::trace!(
            "{} inherits priority {}",
            owner.name(),
            owner.effective_priority()
        );
        let Some(next) = owner.blocked_on() else {
            return;
        };
        queue = next;
    }
}

impl OwnedQueue {
    pub fn new(pi: bool) -> Self {
        OwnedQueue {
            shared: Arc::new(OwnedShared {
                pi,
                queue: WaitQueue::new(Policy::Prio),
                owner: SpinLock::new(None),
            }),
        }
    }

    /// Kernel-side acquisition. Returns [`WaitStatus::Woken`] once the
    /// caller owns the word, an abnormal status otherwise.
    pub fn acquire(
        &self,
        word: &AtomicUsize,
        timeout: Timeout,
        resolve: OwnerResolver<'_>,
    ) -> WaitStatus {
        let curr = Thread::current();
        let handle = curr.handle();

        let mut owner = self.shared.owner.lock();
        if fastlock::try_acquire(word, handle) {
            *owner = Some(curr);
            return WaitStatus::Woken;
        }

        fastlock::set_claimed(word);
        // The holder may have released between the failed acquire and
        // the claim; retry once before committing to sleep.
        if fastlock::try_acquire(word, handle) {
            if self.shared.queue.count() == 0 {
                fastlock::clear_claimed(word);
            }
            *owner = Some(curr);
            return WaitStatus::Woken;
        }

        // A fast-path owner is unknown to the kernel until the first
        // waiter shows up; resolve it now so inheritance has a target.
        if owner.is_none() {
            *owner = resolve(fastlock::owner_of(word.load(Ordering::Relaxed)));
        }

        let sleeper = self.shared.queue.prepare(0);
        curr.set_blocked_on(Some(self.shared.clone()));
        drop(owner);
        rebalance_chain(&self.shared);

        let wakeup = sleeper.wait(timeout);
        curr.set_blocked_on(None);

        match wakeup.status {
            // The releaser transferred the word and the owner slot to
            // us before waking us.
            WaitStatus::Woken => WaitStatus::Woken,
            status => {
                let owner = self.shared.owner.lock();
                if self.shared.queue.count() == 0 {
                    fastlock::clear_claimed(word);
                }
                drop(owner);
                rebalance_chain(&self.shared);
                status
            }
        }
    }

    /// Kernel-side release. Hands the word to the highest-priority
    /// waiter atomically and returns its thread, or clears the word.
    pub fn release(&self, word: &AtomicUsize) -> Option<Arc<Thread>> {
        let curr = Thread::current();
        curr.drop_boost(boost_key(&self.shared));

        let mut owner = self.shared.owner.lock();
        let woken = self.shared.queue.wake_one_transfer(|next, remaining| {
            fastlock::transfer(word, next.handle(), remaining > 0);
        });
        match &woken {
            Some(next) => *owner = Some(next.clone()),
            None => {
                *owner = None;
                fastlock::clear_owner(word);
            }
        }
        drop(owner);
        if woken.is_some() {
            rebalance_chain(&self.shared);
        }
        woken
    }

    /// Whether `thread` currently owns the word.
    pub fn is_owner(&self, word: &AtomicUsize, thread: &Thread) -> bool {
        let handle = thread.handle();
        handle != 0 && fastlock::owner_of(word.load(Ordering::Relaxed)) == handle
    }

    /// Whether anyone owns the word.
    pub fn is_held(&self, word: &AtomicUsize) -> bool {
        fastlock::owner_of(word.load(Ordering::Relaxed)) != 0
    }

    /// Whether any thread is blocked on the queue.
    pub fn pended(&self) -> bool {
        self.shared.queue.count() > 0
    }

    /// Flushes all waiters with an abnormal status. Used on destroy.
    pub fn flush(&self, kind: FlushKind) -> bool {
        self.shared.queue.flush(kind)
    }
}
