// SPDX-License-Identifier: MPL-2.0

use nucleus::clock::Nanos;

use super::{enter, SyscallNumber};
use crate::context::CurrentContext;
use crate::prelude::*;
use crate::signal::{self, SigInfo};

/// Waits for one of the signals in `set`; returns its number.
pub fn sys_sigwait(set: u64) -> Result<u32> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SigWait)?;
    signal::wait(&cur.as_ctx(), set, None).map(|si| si.signo)
}

/// Like `sys_sigwaitinfo` with a deadline; expiry reads `EAGAIN`.
pub fn sys_sigtimedwait(set: u64, deadline: Nanos) -> Result<SigInfo> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SigTimedwait)?;
    signal::wait(&cur.as_ctx(), set, Some(deadline)).map_err(|err| {
        if err.error() == Errno::ETIMEDOUT {
            Error::new(Errno::EAGAIN)
        } else {
            err
        }
    })
}

pub fn sys_sigwaitinfo(set: u64) -> Result<SigInfo> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SigWaitinfo)?;
    signal::wait(&cur.as_ctx(), set, None)
}

pub fn sys_sigpending() -> Result<u64> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SigPending)?;
    Ok(signal::pending(&cur.as_ctx()))
}

pub fn sys_sigqueue(tid: u64, signo: u32, value: u64) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SigQueue)?;
    let ctx = cur.as_ctx();
    let Some(target) = ctx.process.thread_by_tid(tid) else {
        return_errno!(Errno::ESRCH);
    };
    signal::queue(&ctx, &target, signo, value)
}

/// Thread-directed kill; this is also the host-signal injection path
/// that interrupts real-time sleeps.
pub fn sys_sigkill(tid: u64, signo: u32) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::SigKill)?;
    signal::kill(&cur.as_ctx(), tid, signo)
}
