// SPDX-License-Identifier: MPL-2.0

//! Synchronization services: wait queues, the fastlock word protocol
//! and ownership-aware queues with priority inheritance.

pub mod fastlock;
pub mod owned;
pub mod wait_queue;

pub use owned::OwnedQueue;
pub use wait_queue::{FlushKind, Policy, Sleeper, WaitQueue, WaitStatus, Wakeup};
