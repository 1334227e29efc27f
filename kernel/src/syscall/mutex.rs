// SPDX-License-Identifier: MPL-2.0

use nucleus::clock::Timeout;

use super::{enter, SyscallNumber};
use crate::context::CurrentContext;
use crate::mutex::{self, Mutex, MutexAttr};
use crate::prelude::*;
use crate::registry::Handle;

pub(crate) fn sys_mutex_init(attr: MutexAttr) -> Result<Arc<Mutex>> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MutexInit)?;
    Mutex::create(cur.process(), attr)
}

pub fn sys_mutex_check_init(handle: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MutexCheckInit)?;
    mutex::check_init(&cur.as_ctx(), handle)
}

pub fn sys_mutex_lock(handle: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MutexLock)?;
    mutex::timedlock_break(&cur.as_ctx(), handle, Timeout::Never)
}

pub fn sys_mutex_timedlock(handle: Handle, timeout: Timeout) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MutexTimedlock)?;
    mutex::timedlock_break(&cur.as_ctx(), handle, timeout)
}

pub fn sys_mutex_trylock(handle: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MutexTrylock)?;
    mutex::trylock(&cur.as_ctx(), handle)
}

pub fn sys_mutex_unlock(handle: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MutexUnlock)?;
    mutex::unlock(&cur.as_ctx(), handle)
}

pub fn sys_mutex_destroy(handle: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MutexDestroy)?;
    mutex::destroy(&cur.as_ctx(), handle)
}
