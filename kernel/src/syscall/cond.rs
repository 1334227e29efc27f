// SPDX-License-Identifier: MPL-2.0

use nucleus::clock::Nanos;

use super::{enter, SyscallNumber};
use crate::cond::{self, Cond, CondAttr};
use crate::context::CurrentContext;
use crate::prelude::*;
use crate::registry::Handle;

pub(crate) fn sys_cond_init(attr: CondAttr) -> Result<Arc<Cond>> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::CondInit)?;
    Cond::create(cur.process(), attr)
}

pub fn sys_cond_wait_prologue(
    cond: Handle,
    mutex: Handle,
    deadline: Option<Nanos>,
) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::CondWaitPrologue)?;
    cond::wait_prologue(&cur.as_ctx(), cond, mutex, deadline)
}

/// Returns whether the condvar unbound from the mutex.
pub fn sys_cond_wait_epilogue(cond: Handle, mutex: Handle) -> Result<bool> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::CondWaitEpilogue)?;
    cond::wait_epilogue(&cur.as_ctx(), cond, mutex)
}

pub fn sys_cond_signal(cond: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::CondSignal)?;
    cond::signal(&cur.as_ctx(), cond)
}

pub fn sys_cond_broadcast(cond: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::CondBroadcast)?;
    cond::broadcast(&cur.as_ctx(), cond)
}

pub fn sys_cond_destroy(cond: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::CondDestroy)?;
    cond::destroy(&cur.as_ctx(), cond)
}
