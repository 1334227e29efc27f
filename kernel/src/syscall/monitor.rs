// SPDX-License-Identifier: MPL-2.0

use nucleus::clock::Nanos;

use super::{enter, SyscallNumber};
use crate::context::CurrentContext;
use crate::monitor::{self, Monitor, MonitorAttr, MonitorEvent};
use crate::prelude::*;
use crate::registry::Handle;

pub(crate) fn sys_monitor_init(attr: MonitorAttr) -> Result<Arc<Monitor>> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MonitorInit)?;
    Monitor::create(cur.process(), attr)
}

pub fn sys_monitor_enter(handle: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MonitorEnter)?;
    monitor::enter(&cur.as_ctx(), handle)
}

pub fn sys_monitor_exit(handle: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MonitorExit)?;
    monitor::exit(&cur.as_ctx(), handle)
}

pub fn sys_monitor_wait(
    handle: Handle,
    event: MonitorEvent,
    deadline: Option<Nanos>,
) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MonitorWait)?;
    monitor::wait(&cur.as_ctx(), handle, event, deadline)
}

pub fn sys_monitor_sync(handle: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MonitorSync)?;
    monitor::sync(&cur.as_ctx(), handle)
}

pub fn sys_monitor_destroy(handle: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MonitorDestroy)?;
    monitor::destroy(&cur.as_ctx(), handle)
}
