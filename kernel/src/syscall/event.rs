// SPDX-License-Identifier: MPL-2.0

use nucleus::clock::Nanos;

use super::{enter, SyscallNumber};
use crate::context::CurrentContext;
use crate::event::{self, Event, EventAttr, EventInfo, EventMode};
use crate::prelude::*;
use crate::registry::Handle;

pub(crate) fn sys_event_init(value: u32, attr: EventAttr) -> Result<Arc<Event>> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::EventInit)?;
    Event::create(cur.process(), value, attr)
}

pub fn sys_event_wait(
    handle: Handle,
    mask: u32,
    mode: EventMode,
    deadline: Option<Nanos>,
) -> Result<u32> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::EventWait)?;
    event::wait(&cur.as_ctx(), handle, mask, mode, deadline)
}

pub fn sys_event_sync(handle: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::EventSync)?;
    event::sync(&cur.as_ctx(), handle)
}

pub fn sys_event_inquire(handle: Handle) -> Result<EventInfo> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::EventInquire)?;
    event::inquire(&cur.as_ctx(), handle)
}

pub fn sys_event_destroy(handle: Handle) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::EventDestroy)?;
    event::destroy(&cur.as_ctx(), handle)
}
