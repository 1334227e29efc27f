// SPDX-License-Identifier: MPL-2.0

use nucleus::clock::Nanos;

use super::{enter, SyscallNumber};
use crate::context::CurrentContext;
use crate::prelude::*;
use crate::registry::Handle;
use crate::sem::{self, OFlags, Sem, SemFlags, ShadowSem};

pub(crate) fn sys_sem_init(pshared: bool, value: u32) -> Result<Arc<Sem>> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SemInit)?;
    let flags = if pshared {
        SemFlags::PSHARED
    } else {
        SemFlags::empty()
    };
    Sem::create(cur.process(), "", flags, value)
}

/// The non-portable init accepting the full flag set.
pub(crate) fn sys_sem_init_np(flags: SemFlags, value: u32) -> Result<Arc<Sem>> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SemInitNp)?;
    Sem::create(cur.process(), "", flags, value)
}

pub fn sys_sem_post(handle: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SemPost)?;
    sem::post(&cur.as_ctx(), handle)
}

pub fn sys_sem_wait(handle: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SemWait)?;
    sem::wait(&cur.as_ctx(), handle, None)
}

pub fn sys_sem_timedwait(handle: Handle, deadline: Option<Nanos>) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SemTimedwait)?;
    sem::wait(&cur.as_ctx(), handle, deadline)
}

pub fn sys_sem_trywait(handle: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SemTrywait)?;
    sem::trywait(&cur.as_ctx(), handle)
}

pub fn sys_sem_getvalue(handle: Handle) -> Result<i64> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SemGetvalue)?;
    sem::getvalue(&cur.as_ctx(), handle)
}

pub fn sys_sem_broadcast(handle: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SemBroadcastNp)?;
    sem::broadcast(&cur.as_ctx(), handle)
}

/// Returns whether pended waiters were flushed (warn-delete).
pub fn sys_sem_destroy(handle: Handle) -> Result<bool> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SemDestroy)?;
    sem::destroy(&cur.as_ctx(), handle)
}

pub fn sys_sem_open(
    name: &str,
    oflags: OFlags,
    value: u32,
    extra: SemFlags,
) -> Result<Arc<ShadowSem>> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SemOpen)?;
    sem::open(&cur.as_ctx(), name, oflags, value, extra)
}

pub fn sys_sem_close(name: &str) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SemClose)?;
    sem::close(&cur.as_ctx(), name)
}

pub fn sys_sem_unlink(name: &str) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SemUnlink)?;
    sem::unlink(&cur.as_ctx(), name)
}
