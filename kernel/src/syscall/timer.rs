// SPDX-License-Identifier: MPL-2.0

use nucleus::clock::Nanos;

use super::{enter, SyscallNumber};
use crate::clock::ClockId;
use crate::context::CurrentContext;
use crate::prelude::*;
use crate::signal::SigEvent;
use crate::timer;

pub fn sys_timer_create(
    clock: ClockId,
    event: Option<SigEvent>,
    target_tid: Option<u64>,
) -> Result<usize> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::TimerCreate)?;
    timer::create(&cur.as_ctx(), clock, event, target_tid)
}

pub fn sys_timer_delete(id: usize) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::TimerDelete)?;
    timer::delete(&cur.as_ctx(), id)
}

pub fn sys_timer_settime(
    id: usize,
    absolute: bool,
    value: Nanos,
    interval: Nanos,
) -> Result<(Nanos, Nanos)> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::TimerSettime)?;
    timer::settime(&cur.as_ctx(), id, absolute, value, interval)
}

pub fn sys_timer_gettime(id: usize) -> Result<(Nanos, Nanos)> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::TimerGettime)?;
    timer::gettime(&cur.as_ctx(), id)
}

pub fn sys_timer_getoverrun(id: usize) -> Result<u32> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::TimerGetoverrun)?;
    timer::getoverrun(&cur.as_ctx(), id)
}
