// SPDX-License-Identifier: MPL-2.0

//! The per-call context threaded through every operation.
//!
//! Global mutable state (containers, registry, pools) hangs off the
//! [`Kernel`] and [`Process`] the context references; the only
//! implicit state is the current-thread binding consulted here, at
//! the syscall boundary.

use crate::prelude::*;
use crate::process::{Kernel, Process};
use crate::thread::RtThread;

/// Borrowed view of the caller's identity, passed into every
/// kernel-side operation.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub kernel: &'a Arc<Kernel>,
    pub process: &'a Arc<Process>,
    pub thread: &'a Arc<RtThread>,
}

/// Owned caller identity, resolved from the current-thread binding.
pub struct CurrentContext {
    kernel: Arc<Kernel>,
    process: Arc<Process>,
    thread: Arc<RtThread>,
}

impl CurrentContext {
    /// Resolves the calling thread's context. Fails with `ESRCH` when
    /// the caller was never attached to a process.
    pub fn get() -> Result<CurrentContext> {
        let Some(thread) = RtThread::current() else {
            return_errno_with_message!(Errno::ESRCH, "caller is not an attached thread");
        };
        let Some(process) = thread.process() else {
            return_errno_with_message!(Errno::ESRCH, "caller's process is gone");
        };
        let kernel = process.kernel().clone();
        Ok(CurrentContext {
            kernel,
            process,
            thread,
        })
    }

    pub fn as_ctx(&self) -> Context<'_> {
        Context {
            kernel: &self.kernel,
            process: &self.process,
            thread: &self.thread,
        }
    }

    pub fn thread(&self) -> &Arc<RtThread> {
        &self.thread
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }
}
