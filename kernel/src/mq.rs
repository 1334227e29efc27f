// SPDX-License-Identifier: MPL-2.0

//! Message queues.
//!
//! A queue owns a pool of fixed-size message slots linked on a free
//! list; ready messages queue in descending priority with FIFO order
//! within a priority. Senders and receivers block on their own wait
//! queues, and a sender finding a sleeping receiver hands the slot
//! straight over without touching the ready list. The 0-to-non-empty
//! transition rings the read select sink and fires the armed
//! notification, if any; full-to-non-full rings the write sink.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use nucleus::clock::{Nanos, Timeout};
use nucleus::sync::wait_queue::{FlushKind, WaitStatus};
use nucleus::sync::{Policy, WaitQueue};

use crate::clock::{self, ClockId};
use crate::context::Context;
use crate::prelude::*;
use crate::process::{Descriptor, Kernel};
use crate::registry::Handle;
use crate::select::SelectSink;
use crate::signal::{self, SigCode, SigEvent, SigInfo};
use crate::thread::RtThread;

pub(crate) const MQ_MAGIC: u32 = 0x8686_0307;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    fn readable(self) -> bool {
        self != AccessMode::WriteOnly
    }

    fn writable(self) -> bool {
        self != AccessMode::ReadOnly
    }
}

bitflags::bitflags! {
    pub struct MqOpenFlags: u32 {
        const CREAT    = 0x1;
        const EXCL     = 0x2;
        const NONBLOCK = 0x4;
    }
}

/// Creation-time attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MqAttr {
    pub maxmsg: usize,
    pub msgsize: usize,
}

impl Default for MqAttr {
    fn default() -> Self {
        MqAttr {
            maxmsg: crate::config::MQ_DEFAULT_MAXMSG,
            msgsize: crate::config::MQ_DEFAULT_MSGSIZE,
        }
    }
}

/// Attributes reported by `getattr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MqAttrFull {
    pub nonblock: bool,
    pub maxmsg: usize,
    pub msgsize: usize,
    pub curmsgs: usize,
}

struct MsgSlot {
    prio: u32,
    len: usize,
    data: Box<[u8]>,
}

struct NotifyTarget {
    thread: Arc<RtThread>,
    event: SigEvent,
}

struct MqInner {
    free: Vec<usize>,
    /// Ready messages, descending priority, FIFO within a priority.
    queued: VecDeque<(usize, u32)>,
    notify: Option<NotifyTarget>,
    refs: u32,
}

pub struct Mq {
    magic: AtomicU32,
    handle: AtomicU32,
    name: String,
    attr: MqAttr,
    slots: Box<[SpinLock<MsgSlot>]>,
    inner: SpinLock<MqInner>,
    receivers: WaitQueue,
    senders: WaitQueue,
    read_sink: SelectSink,
    write_sink: SelectSink,
}

impl Mq {
    fn create(kernel: &Arc<Kernel>, name: &str, attr: MqAttr) -> Result<Arc<Mq>> {
        if attr.maxmsg == 0 || attr.msgsize == 0 {
            return_errno_with_message!(Errno::EINVAL, "degenerate queue geometry");
        }
        let slots = (0..attr.maxmsg)
            .map(|_| {
                SpinLock::new(MsgSlot {
                    prio: 0,
                    len: 0,
                    data: vec![0u8; attr.msgsize].into_boxed_slice(),
                })
            })
            .collect();
        let mq = Arc::new(Mq {
            magic: AtomicU32::new(MQ_MAGIC),
            handle: AtomicU32::new(0),
            name: name.to_owned(),
            attr,
            slots,
            inner: SpinLock::new(MqInner {
                free: (0..attr.maxmsg).collect(),
                queued: VecDeque::new(),
                notify: None,
                // One for the name link, one for the opening
                // descriptor.
                refs: 2,
            }),
            receivers: WaitQueue::new(Policy::Prio),
            senders: WaitQueue::new(Policy::Prio),
            read_sink: SelectSink::new(false),
            write_sink: SelectSink::new(true),
        });
        let handle = kernel
            .registry()
            .enter_named(&format!("mq/{name}"), mq.clone())?;
        mq.handle.store(handle.raw(), Ordering::Relaxed);
        Ok(mq)
    }

    fn handle(&self) -> Handle {
        Handle::from_raw(self.handle.load(Ordering::Relaxed))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn read_sink(&self) -> &SelectSink {
        &self.read_sink
    }

    pub(crate) fn write_sink(&self) -> &SelectSink {
        &self.write_sink
    }

    fn destroy(self: &Arc<Mq>, kernel: &Arc<Kernel>) {
        self.magic.store(0, Ordering::Release);
        self.receivers.flush(FlushKind::Destroy);
        self.senders.flush(FlushKind::Destroy);
        let _ = kernel.registry().remove(self.handle());
    }

    pub(crate) fn unref(self: &Arc<Mq>, kernel: &Arc<Kernel>) {
        let mut inner = self.inner.lock();
        inner.refs = inner.refs.saturating_sub(1);
        let gone = inner.refs == 0;
        drop(inner);
        if gone {
            self.destroy(kernel);
        }
    }
}

/// A message queue descriptor in the process handle table.
pub struct Mqd {
    mq: Arc<Mq>,
    access: AccessMode,
    nonblock: AtomicBool,
}

impl Mqd {
    pub(crate) fn queue(&self) -> &Arc<Mq> {
        &self.mq
    }

    pub(crate) fn release(&self, kernel: &Arc<Kernel>) {
        self.mq.unref(kernel);
    }
}

fn resolve(ctx: &Context<'_>, fd: i32) -> Result<(Arc<Mq>, AccessMode, bool)> {
    let descs = ctx.process.descs.lock();
    let Descriptor::Mq(mqd) = descs.get(fd)? else {
        return_errno!(Errno::EBADF);
    };
    if mqd.mq.magic.load(Ordering::Acquire) != MQ_MAGIC {
        return_errno!(Errno::EBADF);
    }
    Ok((
        mqd.mq.clone(),
        mqd.access,
        mqd.nonblock.load(Ordering::Relaxed),
    ))
}

/// Opens (or creates) a queue, returning a process-local descriptor.
pub fn open(
    ctx: &Context<'_>,
    name: &str,
    access: AccessMode,
    oflags: MqOpenFlags,
    attr: Option<MqAttr>,
) -> Result<i32> {
    let registered = format!("mq/{name}");
    let mq = match ctx.kernel.registry().bind(&registered) {
        Ok(handle) => {
            if oflags.contains(MqOpenFlags::CREAT | MqOpenFlags::EXCL) {
                return_errno!(Errno::EEXIST);
            }
            let mq = ctx.kernel.registry().fetch::<Mq>(handle)?;
            mq.inner.lock().refs += 1;
            mq
        }
        Err(err) if err.error() == Errno::EAGAIN => {
            if !oflags.contains(MqOpenFlags::CREAT) {
                return_errno!(Errno::ENOENT);
            }
            let attr = attr.unwrap_or_default();
            debug!(
                "creating queue {name}: {} x {} bytes",
                attr.maxmsg, attr.msgsize
            );
            Mq::create(ctx.kernel, name, attr)?
        }
        Err(err) => return Err(err),
    };
    let mqd = Mqd {
        mq,
        access,
        nonblock: AtomicBool::new(oflags.contains(MqOpenFlags::NONBLOCK)),
    };
    ctx.process.descs.lock().install(Descriptor::Mq(mqd))
}

pub fn close(ctx: &Context<'_>, fd: i32) -> Result<()> {
    let desc = ctx.process.descs.lock().remove(fd)?;
    let Descriptor::Mq(mqd) = desc else {
        return_errno!(Errno::EBADF);
    };
    mqd.release(ctx.kernel);
    Ok(())
}

pub fn unlink(ctx: &Context<'_>, name: &str) -> Result<()> {
    let handle = ctx.kernel.registry().unlink(&format!("mq/{name}"))?;
    let mq = ctx.kernel.registry().fetch::<Mq>(handle)?;
    mq.unref(ctx.kernel);
    Ok(())
}

pub fn getattr(ctx: &Context<'_>, fd: i32) -> Result<MqAttrFull> {
    let (mq, _, nonblock) = resolve(ctx, fd)?;
    let inner = mq.inner.lock();
    Ok(MqAttrFull {
        nonblock,
        maxmsg: mq.attr.maxmsg,
        msgsize: mq.attr.msgsize,
        curmsgs: inner.queued.len(),
    })
}

/// Only the non-blocking flag of the descriptor is mutable.
pub fn setattr(ctx: &Context<'_>, fd: i32, nonblock: bool) -> Result<MqAttrFull> {
    let old = getattr(ctx, fd)?;
    let descs = ctx.process.descs.lock();
    let Descriptor::Mq(mqd) = descs.get(fd)? else {
        return_errno!(Errno::EBADF);
    };
    mqd.nonblock.store(nonblock, Ordering::Relaxed);
    Ok(old)
}

/// Arms (or disarms, with `None`) the notification: one signal per
/// empty-to-non-empty transition, delivered to the registered thread
/// and disarmed in the same stroke.
pub fn notify(ctx: &Context<'_>, fd: i32, event: Option<SigEvent>) -> Result<()> {
    let (mq, _, _) = resolve(ctx, fd)?;
    let mut inner = mq.inner.lock();
    match event {
        Some(event) => {
            if inner.notify.is_some() {
                return_errno_with_message!(Errno::EBUSY, "notification already armed");
            }
            inner.notify = Some(NotifyTarget {
                thread: ctx.thread.clone(),
                event,
            });
        }
        None => inner.notify = None,
    }
    Ok(())
}

fn mq_timeout(ctx: &Context<'_>, deadline: Option<Nanos>) -> Timeout {
    match deadline {
        None => Timeout::Never,
        Some(ns) => clock::to_timeout(ctx.kernel, ClockId::Realtime, ns),
    }
}

fn map_wait(status: WaitStatus) -> Error {
    match status {
        WaitStatus::Timedout => Error::new(Errno::ETIMEDOUT),
        WaitStatus::Interrupted => Error::new(Errno::EINTR),
        // The queue was torn down under the sleeper.
        _ => Error::new(Errno::EBADF),
    }
}

pub fn timedsend(
    ctx: &Context<'_>,
    fd: i32,
    data: &[u8],
    prio: u32,
    deadline: Option<Nanos>,
) -> Result<()> {
    let (mq, access, nonblock) = resolve(ctx, fd)?;
    if !access.writable() {
        return_errno!(Errno::EBADF);
    }
    if data.len() > mq.attr.msgsize {
        return_errno!(Errno::EMSGSIZE);
    }

    // Claim a free slot, or wait for a receiver to donate one.
    let index = {
        let mut inner = mq.inner.lock();
        match inner.free.pop() {
            Some(index) => {
                if inner.free.is_empty() {
                    mq.write_sink.signal(false);
                }
                index
            }
            None if nonblock => return_errno!(Errno::EAGAIN),
            None => {
                let sleeper = mq.senders.prepare(0);
                drop(inner);
                let wakeup = sleeper.wait(mq_timeout(ctx, deadline));
                match wakeup.status {
                    WaitStatus::Woken => wakeup.payload.expect("sender woken without a slot") as usize,
                    status => return Err(map_wait(status)),
                }
            }
        }
    };

    // The payload copy happens outside the queue lock; the slot is
    // exclusively ours until it reaches the ready list.
    {
        let mut slot = mq.slots[index].lock();
        slot.prio = prio;
        slot.len = data.len();
        slot.data[..data.len()].copy_from_slice(data);
    }

    let mut inner = mq.inner.lock();
    // Pipelined delivery: hand the slot straight to a sleeping
    // receiver.
    if mq.receivers.wake_one_with(index as u64).is_some() {
        return Ok(());
    }
    let at = inner
        .queued
        .iter()
        .position(|&(_, queued_prio)| queued_prio < prio)
        .unwrap_or(inner.queued.len());
    inner.queued.insert(at, (index, prio));
    if inner.queued.len() == 1 {
        mq.read_sink.signal(true);
        if let Some(target) = inner.notify.take() {
            let si = SigInfo {
                signo: target.event.signo,
                code: SigCode::MesgQ,
                source: mq.handle().raw() as u64,
                value: target.event.value,
                overrun: 0,
            };
            // Losing the notification to pool exhaustion is the
            // sender's problem only in so far as the log says so.
            let _ = signal::send(ctx.kernel, &target.thread, si);
        }
    }
    Ok(())
}

pub fn timedreceive(
    ctx: &Context<'_>,
    fd: i32,
    max_len: usize,
    deadline: Option<Nanos>,
) -> Result<(Vec<u8>, u32)> {
    let (mq, access, nonblock) = resolve(ctx, fd)?;
    if !access.readable() {
        return_errno!(Errno::EBADF);
    }
    if max_len < mq.attr.msgsize {
        return_errno!(Errno::EMSGSIZE);
    }

    let index = {
        let mut inner = mq.inner.lock();
        match inner.queued.pop_front() {
            Some((index, _)) => {
                if inner.queued.is_empty() {
                    mq.read_sink.signal(false);
                }
                index
            }
            None if nonblock => return_errno!(Errno::EAGAIN),
            None => {
                let sleeper = mq.receivers.prepare(0);
                drop(inner);
                let wakeup = sleeper.wait(mq_timeout(ctx, deadline));
                match wakeup.status {
                    WaitStatus::Woken => {
                        wakeup.payload.expect("receiver woken without a message") as usize
                    }
                    status => return Err(map_wait(status)),
                }
            }
        }
    };

    let (data, prio) = {
        let slot = mq.slots[index].lock();
        (slot.data[..slot.len].to_vec(), slot.prio)
    };

    let mut inner = mq.inner.lock();
    // Donate the free slot to a waiting sender, or bank it.
    if mq.senders.wake_one_with(index as u64).is_none() {
        inner.free.push(index);
        if inner.free.len() == 1 {
            mq.write_sink.signal(true);
        }
    }
    Ok((data, prio))
}
