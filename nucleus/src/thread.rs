// SPDX-License-Identifier: MPL-2.0

//! Nucleus threads.
//!
//! A [`Thread`] is the nucleus-side control block shadowing one host
//! thread. It carries the scheduling identity every synchronization
//! service keys on: base and effective priority (the latter possibly
//! boosted through priority inheritance), the registry handle used by
//! the fastlock protocol, state bits, and the wait binding that lets
//! an external event interrupt a sleep.

use core::cell::RefCell;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::io;
use std::sync::Arc;

use spin::Mutex as SpinLock;

use crate::sync::owned::OwnedShared;
use crate::sync::wait_queue::WaitNode;

bitflags::bitflags! {
    /// Thread state bits.
    pub struct State: u32 {
        /// Runs under a non-real-time policy; may not stay relaxed
        /// while holding a real-time lock.
        const WEAK = 0x01;
        /// Currently relaxed to the general-purpose stage.
        const RELAXED = 0x02;
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct Thread {
    name: String,
    id: u64,
    handle: AtomicU32,
    base_prio: AtomicI32,
    eff_prio: AtomicI32,
    state: AtomicU32,
    res_count: AtomicU32,
    current_wait: SpinLock<Option<Arc<WaitNode>>>,
    boosts: SpinLock<Vec<Boost>>,
    blocked_on: SpinLock<Option<Arc<OwnedShared>>>,
}

struct Boost {
    key: usize,
    prio: i32,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
}

impl Thread {
    fn new(name: &str, prio: i32) -> Self {
        Thread {
            name: name.to_owned(),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            handle: AtomicU32::new(0),
            base_prio: AtomicI32::new(prio),
            eff_prio: AtomicI32::new(prio),
            state: AtomicU32::new(0),
            res_count: AtomicU32::new(0),
            current_wait: SpinLock::new(None),
            boosts: SpinLock::new(Vec::new()),
            blocked_on: SpinLock::new(None),
        }
    }

    /// Spawns a host thread with a fresh nucleus control block
    /// installed as its current binding.
    pub fn spawn<F>(name: &str, prio: i32, body: F) -> io::Result<Spawned>
    where
        F: FnOnce() + Send + 'static,
    {
        let tcb = Arc::new(Thread::new(name, prio));
        let bound = tcb.clone();
        let join = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                CURRENT.with(|current| *current.borrow_mut() = Some(bound));
                body();
                CURRENT.with(|current| *current.borrow_mut() = None);
            })?;
        Ok(Spawned { thread: tcb, join })
    }

    /// Returns the calling thread's control block, attaching a shadow
    /// on first use from a foreign host thread.
    pub fn current() -> Arc<Thread> {
        CURRENT.with(|current| {
            let mut slot = current.borrow_mut();
            if let Some(tcb) = slot.as_ref() {
                return tcb.clone();
            }
            let name = std::thread::current()
                .name()
                .unwrap_or("anon")
                .to_owned();
            let tcb = Arc::new(Thread::new(&name, 0));
            *slot = Some(tcb.clone());
            tcb
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Registry handle, as encoded in fastlock words. Zero until the
    /// personality layer registers the thread.
    pub fn handle(&self) -> u32 {
        self.handle.load(Ordering::Relaxed)
    }

    pub fn set_handle(&self, handle: u32) {
        self.handle.store(handle, Ordering::Relaxed);
    }

    pub fn base_priority(&self) -> i32 {
        self.base_prio.load(Ordering::Relaxed)
    }

    /// Effective priority, including any inheritance boost.
    pub fn effective_priority(&self) -> i32 {
        self.eff_prio.load(Ordering::Relaxed)
    }

    pub fn set_base_priority(&self, prio: i32) {
        self.base_prio.store(prio, Ordering::Relaxed);
        self.recompute_priority();
    }

    pub fn state(&self) -> State {
        State::from_bits_truncate(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, bits: State) {
        self.state.fetch_or(bits.bits(), Ordering::Relaxed);
    }

    pub fn clear_state(&self, bits: State) {
        self.state.fetch_and(!bits.bits(), Ordering::Relaxed);
    }

    /// Count of real-time resources held; a weak thread may not relax
    /// while this is non-zero.
    pub fn resource_count(&self) -> u32 {
        self.res_count.load(Ordering::Relaxed)
    }

    pub fn inc_resource_count(&self) {
        self.res_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_resource_count(&self) {
        let prev = self.res_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }

    /// Interrupts the thread's current interruptible sleep, if any.
    ///
    /// This is the host-signal analog: the sleeper resumes with an
    /// interrupted status and the primitive it was blocked on is left
    /// intact.
    pub fn kick(&self) {
        let node = self.current_wait.lock().clone();
        if let Some(node) = node {
            node.interrupt();
        }
    }

    pub(crate) fn bind_wait(&self, node: Arc<WaitNode>) {
        *self.current_wait.lock() = Some(node);
    }

    pub(crate) fn unbind_wait(&self, node: &Arc<WaitNode>) {
        let mut slot = self.current_wait.lock();
        if let Some(bound) = slot.as_ref() {
            if Arc::ptr_eq(bound, node) {
                *slot = None;
            }
        }
    }

    pub(crate) fn set_blocked_on(&self, queue: Option<Arc<OwnedShared>>) {
        *self.blocked_on.lock() = queue;
    }

    pub(crate) fn blocked_on(&self) -> Option<Arc<OwnedShared>> {
        self.blocked_on.lock().clone()
    }

    /// Installs or updates the boost contributed by the owned queue
    /// identified by `key`. Returns whether the effective priority
    /// changed.
    pub(crate) fn add_boost(&self, key: usize, prio: i32) -> bool {
        let mut boosts = self.boosts.lock();
        match boosts.iter_mut().find(|b| b.key == key) {
            Some(boost) => boost.prio = prio,
            None => boosts.push(Boost { key, prio }),
        }
        drop(boosts);
        self.recompute_priority()
    }

    pub(crate) fn drop_boost(&self, key: usize) -> bool {
        self.boosts.lock().retain(|b| b.key != key);
        self.recompute_priority()
    }

    fn recompute_priority(&self) -> bool {
        let boosts = self.boosts.lock();
        let ceiling = boosts.iter().map(|b| b.prio).max();
        drop(boosts);
        let base = self.base_prio.load(Ordering::Relaxed);
        let eff = ceiling.map_or(base, |c| c.max(base));
        self.eff_prio.swap(eff, Ordering::Relaxed) != eff
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("prio", &self.effective_priority())
            .finish()
    }
}

/// A spawned nucleus thread together with its host join handle.
pub struct Spawned {
    thread: Arc<Thread>,
    join: std::thread::JoinHandle<()>,
}

impl Spawned {
    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    pub fn join(self) {
        // A panicking body already reported itself; surface it here.
        self.join.join().expect("nucleus thread panicked");
    }

    pub fn into_parts(self) -> (Arc<Thread>, std::thread::JoinHandle<()>) {
        (self.thread, self.join)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_attaches_foreign_threads_once() {
        let a = Thread::current();
        let b = Thread::current();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn boosts_raise_and_release_effective_priority() {
        let spawned = Thread::spawn("boostee", 2, || {}).unwrap();
        let t = spawned.thread().clone();
        spawned.join();

        assert_eq!(t.effective_priority(), 2);
        t.add_boost(1, 7);
        assert_eq!(t.effective_priority(), 7);
        t.add_boost(2, 5);
        t.drop_boost(1);
        assert_eq!(t.effective_priority(), 5);
        t.drop_boost(2);
        assert_eq!(t.effective_priority(), 2);
        // A boost below base never lowers the effective priority.
        t.add_boost(3, 1);
        assert_eq!(t.effective_priority(), 2);
    }
}
