// SPDX-License-Identifier: MPL-2.0

//! The prelude imported by nearly every module in this crate.

pub(crate) use std::collections::VecDeque;
pub(crate) use std::sync::{Arc, Weak};

pub(crate) use hashbrown::HashMap;
pub(crate) use log::{debug, trace, warn};
pub(crate) use spin::Mutex as SpinLock;

pub(crate) use crate::error::{Errno, Error, Result};
pub(crate) use crate::{return_errno, return_errno_with_message};
