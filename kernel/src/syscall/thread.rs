// SPDX-License-Identifier: MPL-2.0

use super::{enter, SyscallNumber};
use crate::context::CurrentContext;
use crate::prelude::*;
use crate::thread::{self, RtThread, SchedParam, ThreadStat};

/// Spawns a new real-time thread in the caller's process.
pub fn sys_thread_create<F>(name: &str, param: SchedParam, body: F) -> Result<Arc<RtThread>>
where
    F: FnOnce() + Send + 'static,
{
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::ThreadCreate)?;
    RtThread::spawn(cur.process(), name, param, body)
}

pub fn sys_thread_join(thread: &Arc<RtThread>) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::ThreadJoin)?;
    thread.join()
}

pub fn sys_thread_yield() -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::ThreadYield)?;
    std::thread::yield_now();
    Ok(())
}

pub fn sys_thread_set_schedparam(thread: &Arc<RtThread>, param: SchedParam) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::ThreadSetSchedParam)?;
    thread.set_schedparam(param)
}

pub fn sys_thread_get_schedparam(thread: &Arc<RtThread>) -> Result<SchedParam> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::ThreadGetSchedParam)?;
    Ok(thread.schedparam())
}

pub fn sys_thread_kill(tid: u64, signo: u32) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::ThreadKill)?;
    crate::signal::kill(&cur.as_ctx(), tid, signo)
}

pub fn sys_thread_stat(tid: u64) -> Result<ThreadStat> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::ThreadStat)?;
    let ctx = cur.as_ctx();
    let Some(target) = ctx.process.thread_by_tid(tid) else {
        return_errno!(Errno::ESRCH);
    };
    Ok(thread::stat(&target))
}
