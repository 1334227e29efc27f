// SPDX-License-Identifier: MPL-2.0

//! Shared memory arena.
//!
//! A word-granular region notionally mapped at identical relative
//! offsets into userland and the kernel. Every primitive that needs a
//! user-visible atomic (mutex owner word, semaphore value, condvar
//! pending counter, monitor flags, event bits) allocates a word here
//! and publishes the byte offset in its shadow descriptor, so both
//! sides reach the same cell without pointer translation.
//!
//! Offset 0 is reserved and never a valid allocation.

use core::mem::size_of;
use core::sync::atomic::AtomicUsize;

use spin::Mutex as SpinLock;
use std::sync::Arc;

const WORD: usize = size_of::<usize>();

#[derive(Debug)]
struct ArenaInner {
    words: Box<[AtomicUsize]>,
    free: SpinLock<FreeMap>,
}

#[derive(Debug)]
struct FreeMap {
    // Word 0 stays reserved; indices below `next` not on the list are live.
    list: Vec<u32>,
    next: u32,
}

/// Handle on a mapped arena. Cloning shares the same region.
#[derive(Clone, Debug)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

/// An allocated arena word, released when dropped.
pub struct ArenaCell {
    arena: Arena,
    offset: u32,
}

impl Arena {
    /// Maps a fresh arena of `nwords` words (including the reserved one).
    pub fn new(nwords: usize) -> Self {
        assert!(nwords >= 2, "arena must hold at least one allocatable word");
        let words = (0..nwords).map(|_| AtomicUsize::new(0)).collect();
        Arena {
            inner: Arc::new(ArenaInner {
                words,
                free: SpinLock::new(FreeMap { list: Vec::new(), next: 1 }),
            }),
        }
    }

    /// Allocates one word, returning `None` when the arena is exhausted.
    pub fn alloc_word(&self) -> Option<ArenaCell> {
        let mut free = self.inner.free.lock();
        let index = match free.list.pop() {
            Some(index) => index,
            None => {
                if free.next as usize >= self.inner.words.len() {
                    return None;
                }
                let index = free.next;
                free.next += 1;
                index
            }
        };
        drop(free);
        let cell = ArenaCell {
            arena: self.clone(),
            offset: index * WORD as u32,
        };
        cell.word().store(0, core::sync::atomic::Ordering::Release);
        Some(cell)
    }

    /// Resolves an offset published in a shadow descriptor.
    ///
    /// # Panics
    ///
    /// Panics on the reserved offset 0, misaligned offsets and offsets
    /// beyond the mapping; a correctly linked shadow never holds one.
    pub fn at(&self, offset: u32) -> &AtomicUsize {
        assert!(offset != 0, "offset 0 is reserved");
        assert!(offset as usize % WORD == 0, "unaligned arena offset");
        let index = offset as usize / WORD;
        &self.inner.words[index]
    }

    /// Whether two handles map the same region.
    pub fn same_as(&self, other: &Arena) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl ArenaCell {
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn word(&self) -> &AtomicUsize {
        self.arena.at(self.offset)
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }
}

impl Drop for ArenaCell {
    fn drop(&mut self) {
        let mut free = self.arena.inner.free.lock();
        free.list.push(self.offset / WORD as u32);
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::Ordering;

    use super::*;

    #[test]
    fn offset_zero_is_never_allocated() {
        let arena = Arena::new(8);
        for _ in 0..16 {
            let cell = arena.alloc_word().unwrap();
            assert_ne!(cell.offset(), 0);
            assert_eq!(cell.offset() as usize % WORD, 0);
        }
    }

    #[test]
    fn both_sides_reach_the_same_word() {
        let arena = Arena::new(8);
        let cell = arena.alloc_word().unwrap();
        cell.word().store(0xabcd, Ordering::Release);
        let user_side = arena.clone();
        assert_eq!(user_side.at(cell.offset()).load(Ordering::Acquire), 0xabcd);
    }

    #[test]
    fn exhaustion_and_reuse() {
        let arena = Arena::new(3);
        let a = arena.alloc_word().unwrap();
        let b = arena.alloc_word().unwrap();
        assert!(arena.alloc_word().is_none());
        let off = b.offset();
        drop(b);
        let c = arena.alloc_word().unwrap();
        assert_eq!(c.offset(), off);
        // Freed words come back zeroed.
        assert_eq!(c.word().load(Ordering::Acquire), 0);
        drop(a);
    }
}
