// SPDX-License-Identifier: MPL-2.0

//! The nucleus is the scheduling substrate of the tandem executive.
//!
//! It provides the pieces the personality layer builds on: nucleus
//! threads shadowing host threads, wait queues with priority or FIFO
//! wakeup order, ownership-aware queues implementing the fastlock
//! hand-off protocol with priority inheritance, the shared memory
//! arena holding the user-visible atomic words, a monotonic clock,
//! and a timer wheel.
//!
//! On a production target these services would sit directly on the
//! interrupt path. Here they are host-backed so that every protocol
//! layered above runs with real concurrency.

pub mod arena;
pub mod clock;
pub mod sync;
pub mod thread;
pub mod timer;
