// SPDX-License-Identifier: MPL-2.0

use nucleus::clock::{Nanos, Timeout};

use super::{enter, SyscallNumber};
use crate::context::CurrentContext;
use crate::prelude::*;
use crate::process::Descriptor;
use crate::select::{SelectSink, Selector};

/// Multiplexed wait over message-queue descriptors. Returns the
/// readable and writable subsets.
pub fn sys_select(
    read_fds: &[i32],
    write_fds: &[i32],
    deadline: Option<Nanos>,
) -> Result<(Vec<i32>, Vec<i32>)> {
    let cur = CurrentContext::get()?;
    enter(&cur, SyscallNumber::Select)?;
    let ctx = cur.as_ctx();

    // Resolve all descriptors up front so a bad one fails the call
    // before anything sleeps.
    let mut queues = Vec::new();
    for &fd in read_fds.iter().chain(write_fds.iter()) {
        let descs = ctx.process.descs.lock();
        let Descriptor::Mq(mqd) = descs.get(fd)? else {
            return_errno!(Errno::EBADF);
        };
        queues.push(mqd.queue().clone());
    }
    let sinks: Vec<&SelectSink> = queues
        .iter()
        .enumerate()
        .map(|(index, mq)| {
            if index < read_fds.len() {
                mq.read_sink()
            } else {
                mq.write_sink()
            }
        })
        .collect();

    let timeout = match deadline {
        None => Timeout::Never,
        Some(ns) => Timeout::At(ns),
    };
    let ready = Selector::new().select(&sinks, timeout)?;

    let mut readable = Vec::new();
    let mut writable = Vec::new();
    for index in ready {
        if index < read_fds.len() {
            readable.push(read_fds[index]);
        } else {
            writable.push(write_fds[index - read_fds.len()]);
        }
    }
    Ok((readable, writable))
}
