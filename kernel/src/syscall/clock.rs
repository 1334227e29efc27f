// SPDX-License-Identifier: MPL-2.0

use nucleus::clock::Nanos;

use super::{enter, SyscallNumber};
use crate::clock::{self, ClockId};
use crate::context::CurrentContext;
use crate::prelude::*;

pub fn sys_clock_getres(clock: ClockId) -> Result<Nanos> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::ClockGetres)?;
    Ok(clock::getres(clock))
}

pub fn sys_clock_gettime(clock: ClockId) -> Result<Nanos> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::ClockGettime)?;
    Ok(clock::gettime(cur.as_ctx().kernel, clock))
}

pub fn sys_clock_settime(clock: ClockId, time: Nanos) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::ClockSettime)?;
    clock::settime(cur.as_ctx().kernel, clock, time)
}

/// Sleeps until the absolute `deadline` on `clock`.
pub fn sys_clock_nanosleep(clock: ClockId, deadline: Nanos) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::ClockNanosleep)?;
    clock::nanosleep(&cur.as_ctx(), clock, deadline)
}
