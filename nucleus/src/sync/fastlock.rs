// SPDX-License-Identifier: MPL-2.0

//! Fastlock word encoding.
//!
//! A fastlock is one machine word in the shared arena carrying the
//! owner's thread handle in the upper bits and protocol flags in the
//! two low bits. The uncontended paths run entirely in user space:
//! acquiring is a compare-and-set from the free word to the caller's
//! handle, releasing is the reverse and only legal while no flag bit
//! is set. Everything else traps into the kernel, which transitions
//! the word under its own locks while preserving the spare bits.

use core::sync::atomic::{AtomicUsize, Ordering};

/// At least one thread is, or may be, blocked on the lock; releasing
/// must go through the kernel.
pub const CLAIMED: usize = 0b01;
/// A condition signal is deferred on the owning mutex; the next unlock
/// must drain pending signals before releasing.
pub const COND_SIGNAL: usize = 0b10;
/// All protocol flag bits.
pub const FLAGS_MASK: usize = 0b11;

/// Owner field for a thread handle.
pub fn owner_bits(handle: u32) -> usize {
    (handle as usize) << 2
}

/// Owner handle encoded in a word value; zero means unowned.
pub fn owner_of(word: usize) -> u32 {
    (word >> 2) as u32
}

pub fn is_claimed(word: usize) -> bool {
    word & CLAIMED != 0
}

/// Uncontended user-space acquire: free and flagless, or bust.
pub fn fast_acquire(cell: &AtomicUsize, handle: u32) -> bool {
    cell.compare_exchange(0, owner_bits(handle), Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
}

/// Uncontended user-space release; fails whenever a flag bit is set
/// or the caller is not the owner.
pub fn fast_release(cell: &AtomicUsize, handle: u32) -> bool {
    cell.compare_exchange(owner_bits(handle), 0, Ordering::Release, Ordering::Relaxed)
        .is_ok()
}

/// Kernel-side acquire: succeeds on any ownerless word, preserving
/// the flag bits.
pub fn try_acquire(cell: &AtomicUsize, handle: u32) -> bool {
    cell.fetch_update(Ordering::Acquire, Ordering::Relaxed, |word| {
        (owner_of(word) == 0).then_some(owner_bits(handle) | (word & FLAGS_MASK))
    })
    .is_ok()
}

/// Hands the word to `handle`, keeping the claimed bit when more
/// waiters remain. Spare bits are preserved.
pub fn transfer(cell: &AtomicUsize, handle: u32, still_claimed: bool) {
    let _ = cell.fetch_update(Ordering::AcqRel, Ordering::Relaxed, |word| {
        let mut next = owner_bits(handle) | (word & COND_SIGNAL);
        if still_claimed {
            next |= CLAIMED;
        }
        Some(next)
    });
}

/// Drops owner and claimed, preserving spare bits.
pub fn clear_owner(cell: &AtomicUsize) {
    let _ = cell.fetch_update(Ordering::Release, Ordering::Relaxed, |word| {
        Some(word & COND_SIGNAL)
    });
}

pub fn set_claimed(cell: &AtomicUsize) -> usize {
    cell.fetch_or(CLAIMED, Ordering::AcqRel)
}

pub fn clear_claimed(cell: &AtomicUsize) {
    cell.fetch_and(!CLAIMED, Ordering::AcqRel);
}

pub fn set_spare(cell: &AtomicUsize, bits: usize) {
    debug_assert_eq!(bits & !COND_SIGNAL, 0);
    cell.fetch_or(bits, Ordering::AcqRel);
}

pub fn clear_spare(cell: &AtomicUsize, bits: usize) -> usize {
    debug_assert_eq!(bits & !COND_SIGNAL, 0);
    cell.fetch_and(!bits, Ordering::AcqRel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_round_trips() {
        let word = owner_bits(0x3fff_ffff) | CLAIMED | COND_SIGNAL;
        assert_eq!(owner_of(word), 0x3fff_ffff);
        assert!(is_claimed(word));
    }

    #[test]
    fn fast_paths_respect_flags() {
        let cell = AtomicUsize::new(0);
        assert!(fast_acquire(&cell, 7));
        assert!(!fast_acquire(&cell, 8));
        set_claimed(&cell);
        // A claimed word may no longer be released in user space.
        assert!(!fast_release(&cell, 7));
        clear_claimed(&cell);
        assert!(fast_release(&cell, 7));
    }

    #[test]
    fn kernel_acquire_preserves_spares() {
        let cell = AtomicUsize::new(COND_SIGNAL);
        assert!(!fast_acquire(&cell, 5));
        assert!(try_acquire(&cell, 5));
        let word = cell.load(core::sync::atomic::Ordering::Relaxed);
        assert_eq!(owner_of(word), 5);
        assert_ne!(word & COND_SIGNAL, 0);
    }

    #[test]
    fn transfer_keeps_claim_for_remaining_waiters() {
        let cell = AtomicUsize::new(owner_bits(3) | CLAIMED);
        transfer(&cell, 4, true);
        let word = cell.load(core::sync::atomic::Ordering::Relaxed);
        assert_eq!(owner_of(word), 4);
        assert!(is_claimed(word));
        transfer(&cell, 5, false);
        assert!(!is_claimed(cell.load(core::sync::atomic::Ordering::Relaxed)));
    }
}
