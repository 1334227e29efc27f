// SPDX-License-Identifier: MPL-2.0

use nucleus::clock::Nanos;

use super::{enter, SyscallNumber};
use crate::context::CurrentContext;
use crate::mq::{self, AccessMode, MqAttr, MqAttrFull, MqOpenFlags};
use crate::prelude::*;
use crate::signal::SigEvent;

pub fn sys_mq_open(
    name: &str,
    access: AccessMode,
    oflags: MqOpenFlags,
    attr: Option<MqAttr>,
) -> Result<i32> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MqOpen)?;
    mq::open(&cur.as_ctx(), name, access, oflags, attr)
}

pub fn sys_mq_close(fd: i32) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MqClose)?;
    mq::close(&cur.as_ctx(), fd)
}

pub fn sys_mq_unlink(name: &str) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MqUnlink)?;
    mq::unlink(&cur.as_ctx(), name)
}

pub fn sys_mq_getattr(fd: i32) -> Result<MqAttrFull> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MqGetattr)?;
    mq::getattr(&cur.as_ctx(), fd)
}

pub fn sys_mq_setattr(fd: i32, nonblock: bool) -> Result<MqAttrFull> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MqSetattr)?;
    mq::setattr(&cur.as_ctx(), fd, nonblock)
}

pub fn sys_mq_timedsend(fd: i32, data: &[u8], prio: u32, deadline: Option<Nanos>) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MqTimedsend)?;
    mq::timedsend(&cur.as_ctx(), fd, data, prio, deadline)
}

pub fn sys_mq_timedreceive(
    fd: i32,
    max_len: usize,
    deadline: Option<Nanos>,
) -> Result<(Vec<u8>, u32)> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MqTimedreceive)?;
    mq::timedreceive(&cur.as_ctx(), fd, max_len, deadline)
}

pub fn sys_mq_notify(fd: i32, event: Option<SigEvent>) -> Result<()> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::MqNotify)?;
    mq::notify(&cur.as_ctx(), fd, event)
}
