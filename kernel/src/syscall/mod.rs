// SPDX-License-Identifier: MPL-2.0

//! The numbered syscall surface.
//!
//! Every call has a number in [`SyscallNumber`] and an admissible
//! calling stage; [`enter`] migrates the caller (harden into the
//! real-time stage, or relax for calls that must run on the
//! general-purpose side, such as name lookups) before the family
//! handler runs. The `sys_*` wrappers in the family modules are the
//! only way user-side shadows reach the kernel halves.

mod clock;
mod cond;
mod event;
mod monitor;
mod mq;
mod mutex;
mod sched;
mod select;
mod sem;
mod signal;
mod thread;
mod timer;

pub use clock::*;
pub use cond::*;
pub use event::*;
pub use monitor::*;
pub use mq::*;
pub use mutex::*;
pub use sched::*;
pub use select::*;
pub use sem::*;
pub use signal::*;
pub use thread::*;
pub use timer::*;

use int_to_c_enum::TryFromInt;

use crate::context::CurrentContext;
use crate::prelude::*;

/// Admissible calling stage of a syscall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Only while setting a process up.
    Init,
    /// Must run on the general-purpose stage; the caller is relaxed.
    Lostage,
    /// Runs wherever the caller happens to be.
    Current,
    /// The caller is hardened into the real-time stage first.
    Primary,
    /// Hardens like `Primary` but adapts to the object's scope.
    Conforming,
    /// Hardens and must not be transparently restarted after a host
    /// signal; the wait protocol handles interruption itself.
    NonRestartable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromInt)]
#[repr(u32)]
pub enum SyscallNumber {
    ThreadCreate = 0,
    ThreadSetSchedParam = 1,
    ThreadGetSchedParam = 2,
    ThreadYield = 3,
    ThreadKill = 4,
    ThreadJoin = 5,
    ThreadStat = 6,

    MutexInit = 10,
    MutexCheckInit = 11,
    MutexDestroy = 12,
    MutexLock = 13,
    MutexTimedlock = 14,
    MutexTrylock = 15,
    MutexUnlock = 16,

    CondInit = 20,
    CondDestroy = 21,
    CondWaitPrologue = 22,
    CondWaitEpilogue = 23,
    CondSignal = 24,
    CondBroadcast = 25,

    SemInit = 30,
    SemDestroy = 31,
    SemPost = 32,
    SemWait = 33,
    SemTimedwait = 34,
    SemTrywait = 35,
    SemGetvalue = 36,
    SemOpen = 37,
    SemClose = 38,
    SemUnlink = 39,
    SemInitNp = 40,
    SemBroadcastNp = 41,

    MqOpen = 50,
    MqClose = 51,
    MqUnlink = 52,
    MqGetattr = 53,
    MqSetattr = 54,
    MqTimedsend = 55,
    MqTimedreceive = 56,
    MqNotify = 57,

    MonitorInit = 60,
    MonitorDestroy = 61,
    MonitorEnter = 62,
    MonitorExit = 63,
    MonitorWait = 64,
    MonitorSync = 65,

    EventInit = 70,
    EventDestroy = 71,
    EventWait = 72,
    EventSync = 73,
    EventInquire = 74,

    TimerCreate = 80,
    TimerDelete = 81,
    TimerSettime = 82,
    TimerGettime = 83,
    TimerGetoverrun = 84,

    ClockGetres = 90,
    ClockGettime = 91,
    ClockSettime = 92,
    ClockNanosleep = 93,

    SigWait = 100,
    SigTimedwait = 101,
    SigWaitinfo = 102,
    SigPending = 103,
    SigQueue = 104,
    SigKill = 105,

    Select = 110,

    SchedMinPrio = 120,
    SchedMaxPrio = 121,
    SchedSetConfig = 122,
    SchedGetConfig = 123,
    SchedYield = 124,
}

/// The dispatch table entry for each numbered call.
pub fn stage_of(nr: SyscallNumber) -> Stage {
    use SyscallNumber::*;
    match nr {
        ThreadCreate => Stage::Init,
        ThreadSetSchedParam | ThreadGetSchedParam | ThreadStat => Stage::Conforming,
        ThreadYield => Stage::Primary,
        ThreadKill => Stage::Conforming,
        ThreadJoin => Stage::Lostage,

        MutexInit | MutexCheckInit | MutexDestroy => Stage::Current,
        MutexLock | MutexTimedlock | MutexTrylock | MutexUnlock => Stage::Primary,

        CondInit | CondDestroy => Stage::Current,
        CondWaitPrologue => Stage::NonRestartable,
        CondWaitEpilogue => Stage::Primary,
        CondSignal | CondBroadcast => Stage::Current,

        SemInit | SemInitNp | SemDestroy | SemGetvalue => Stage::Current,
        SemPost | SemWait | SemTimedwait | SemTrywait | SemBroadcastNp => Stage::Primary,
        SemOpen | SemClose | SemUnlink => Stage::Lostage,

        MqOpen | MqClose | MqUnlink => Stage::Lostage,
        MqGetattr | MqSetattr | MqNotify => Stage::Current,
        MqTimedsend | MqTimedreceive => Stage::Primary,

        MonitorInit | MonitorDestroy => Stage::Current,
        MonitorEnter | MonitorExit | MonitorSync => Stage::Primary,
        MonitorWait => Stage::NonRestartable,

        EventInit | EventDestroy | EventInquire => Stage::Current,
        EventWait => Stage::Primary,
        EventSync => Stage::Current,

        TimerCreate | TimerDelete => Stage::Current,
        TimerSettime | TimerGettime | TimerGetoverrun => Stage::Primary,

        ClockGetres | ClockGettime | ClockSettime => Stage::Current,
        ClockNanosleep => Stage::Primary,

        SigWait | SigTimedwait | SigWaitinfo => Stage::NonRestartable,
        SigPending | SigQueue | SigKill => Stage::Conforming,

        Select => Stage::NonRestartable,

        SchedMinPrio | SchedMaxPrio | SchedSetConfig | SchedGetConfig => Stage::Current,
        SchedYield => Stage::Primary,
    }
}

/// Applies the stage discipline before a handler runs.
pub(crate) fn enter(cur: &CurrentContext, nr: SyscallNumber) -> Result<()> {
    trace!("syscall {:?}", nr);
    match stage_of(nr) {
        Stage::Primary | Stage::Conforming | Stage::NonRestartable => {
            cur.thread().harden();
            Ok(())
        }
        Stage::Lostage => cur.thread().relax(),
        Stage::Init | Stage::Current => Ok(()),
    }
}
