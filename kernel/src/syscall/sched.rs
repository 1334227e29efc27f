// SPDX-License-Identifier: MPL-2.0

use super::{enter, SyscallNumber};
use crate::config::{PRIO_MAX, PRIO_MIN};
use crate::context::CurrentContext;
use crate::prelude::*;

pub fn sys_sched_minprio() -> Result<i32> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SchedMinPrio)?;
    Ok(PRIO_MIN)
}

pub fn sys_sched_maxprio() -> Result<i32> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SchedMaxPrio)?;
    Ok(PRIO_MAX)
}

pub fn sys_sched_yield() -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SchedYield)?;
    std::thread::yield_now();
    Ok(())
}

/// Runtime scheduling-class reconfiguration is not part of this core.
pub fn sys_sched_setconfig() -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SchedSetConfig)?;
    return_errno!(Errno::ENOTSUP)
}

pub fn sys_sched_getconfig() -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SchedGetConfig)?;
    return_errno!(Errno::ENOTSUP)
}
