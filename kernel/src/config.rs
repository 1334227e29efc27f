// SPDX-License-Identifier: MPL-2.0

//! Compile-time sizing of the kernel tables.

/// Registry capacity, shared by all object kinds.
pub const REGISTRY_SLOTS: usize = 512;

/// Longest name accepted by the registry.
pub const NAME_MAX: usize = 64;

/// Words in the per-process shared arena (including the reserved one).
pub const PROCESS_ARENA_WORDS: usize = 4096;

/// Words in the system arena backing process-shared objects.
pub const SYSTEM_ARENA_WORDS: usize = 4096;

/// Signal numbers, 1-based. Numbers at or above [`SIGRTMIN`] queue
/// per-source; lower ones coalesce into a single pending notification.
pub const NSIG: usize = 32;
pub const SIGRTMIN: u32 = 16;

/// The conventional timer-expiry signal used when a timer is created
/// without an explicit notification target.
pub const SIGALRM: u32 = 14;

/// Ceiling on reported overruns (timers and coalesced signals).
pub const DELAYMAX: u32 = 0x7fff_ffff;

/// Interval timers per process.
pub const NRTIMERS: usize = 128;

/// Per-process descriptor table size (message queues, named semaphores).
pub const NRDESCS: usize = 128;

/// Semaphore value ceiling.
pub const SEM_VALUE_MAX: i64 = i32::MAX as i64;

/// Message queue defaults when `open` passes no attributes.
pub const MQ_DEFAULT_MAXMSG: usize = 10;
pub const MQ_DEFAULT_MSGSIZE: usize = 8192;

/// Scheduling priority range of the real-time class.
pub const PRIO_MIN: i32 = 0;
pub const PRIO_MAX: i32 = 99;
