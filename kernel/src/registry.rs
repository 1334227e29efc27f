// SPDX-License-Identifier: MPL-2.0

//! The handle registry.
//!
//! Every kernel object user space can name is published here. A
//! [`Handle`] is a stable slot index; each slot carries a generation
//! stamp so that a lookup done after dropping and reacquiring a lock
//! can detect that the slot was reused for a different object in the
//! meantime. Named entries additionally appear in the name index and
//! can be bound without blocking.

use core::any::Any;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::{NAME_MAX, REGISTRY_SLOTS};
use crate::prelude::*;

/// A registry handle; the null handle never designates an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub const NULL: Handle = Handle(0);

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Handle {
        Handle(raw)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

type Object = Arc<dyn Any + Send + Sync>;

struct Slot {
    obj: Option<Object>,
    stamp: u32,
    name: Option<String>,
}

struct Inner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    names: HashMap<String, Handle>,
    next_stamp: u32,
}

pub struct Registry {
    inner: SpinLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: SpinLock::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                names: HashMap::new(),
                next_stamp: 1,
            }),
        }
    }

    fn enter_inner(inner: &mut Inner, obj: Object, name: Option<String>) -> Result<Handle> {
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                if inner.slots.len() >= REGISTRY_SLOTS {
                    return_errno_with_message!(Errno::EAGAIN, "registry exhausted");
                }
                inner.slots.push(Slot {
                    obj: None,
                    stamp: 0,
                    name: None,
                });
                (inner.slots.len() - 1) as u32
            }
        };
        let stamp = inner.next_stamp;
        inner.next_stamp = inner.next_stamp.wrapping_add(1);
        let handle = Handle(index + 1);
        let slot = &mut inner.slots[index as usize];
        slot.obj = Some(obj);
        slot.stamp = stamp;
        slot.name = name.clone();
        if let Some(name) = name {
            inner.names.insert(name, handle);
        }
        Ok(handle)
    }

    /// Publishes an anonymous object.
    pub fn enter_anon(&self, obj: Object) -> Result<Handle> {
        Self::enter_inner(&mut self.inner.lock(), obj, None)
    }

    /// Publishes an object under `name`.
    pub fn enter_named(&self, name: &str, obj: Object) -> Result<Handle> {
        if name.len() > NAME_MAX {
            return_errno!(Errno::ENAMETOOLONG);
        }
        let mut inner = self.inner.lock();
        if inner.names.contains_key(name) {
            return_errno_with_message!(Errno::EEXIST, "name already registered");
        }
        Self::enter_inner(&mut inner, obj, Some(name.to_owned()))
    }

    /// Non-blocking bind: the handle registered under `name`, or
    /// `EAGAIN` when nothing is published there yet.
    pub fn bind(&self, name: &str) -> Result<Handle> {
        if name.len() > NAME_MAX {
            return_errno!(Errno::ENAMETOOLONG);
        }
        match self.inner.lock().names.get(name) {
            Some(handle) => Ok(*handle),
            None => return_errno!(Errno::EAGAIN),
        }
    }

    fn slot<'a>(inner: &'a Inner, handle: Handle) -> Option<&'a Slot> {
        if handle.is_null() {
            return None;
        }
        inner.slots.get(handle.0 as usize - 1)
    }

    /// Resolves a handle to the published object.
    pub fn lookup(&self, handle: Handle) -> Option<Object> {
        let inner = self.inner.lock();
        Self::slot(&inner, handle)?.obj.clone()
    }

    /// Resolves a handle together with the slot's generation stamp.
    pub fn lookup_stamped(&self, handle: Handle) -> Option<(Object, u32)> {
        let inner = self.inner.lock();
        let slot = Self::slot(&inner, handle)?;
        Some((slot.obj.clone()?, slot.stamp))
    }

    /// Typed resolution; a missing slot or a type mismatch both read
    /// as a stale handle.
    pub fn fetch<T: Any + Send + Sync>(&self, handle: Handle) -> Result<Arc<T>> {
        self.lookup(handle)
            .and_then(|obj| obj.downcast::<T>().ok())
            .ok_or_else(|| Error::with_message(Errno::EINVAL, "stale handle"))
    }

    pub fn fetch_stamped<T: Any + Send + Sync>(&self, handle: Handle) -> Result<(Arc<T>, u32)> {
        let (obj, stamp) = self
            .lookup_stamped(handle)
            .ok_or_else(|| Error::with_message(Errno::EINVAL, "stale handle"))?;
        let obj = obj
            .downcast::<T>()
            .map_err(|_| Error::with_message(Errno::EINVAL, "stale handle"))?;
        Ok((obj, stamp))
    }

    /// Unpublishes a handle; its slot may be reused with a new stamp.
    pub fn remove(&self, handle: Handle) -> Result<()> {
        let mut inner = self.inner.lock();
        let index = handle.0.checked_sub(1).map(|i| i as usize);
        let Some(slot) = index.and_then(|i| inner.slots.get_mut(i)) else {
            return_errno!(Errno::EINVAL);
        };
        if slot.obj.take().is_none() {
            return_errno!(Errno::EINVAL);
        }
        let name = slot.name.take();
        if let Some(name) = name {
            inner.names.remove(&name);
        }
        inner.free.push(handle.0 - 1);
        Ok(())
    }

    /// Detaches `name` from its slot, leaving the object published
    /// anonymously until removed.
    pub fn unlink(&self, name: &str) -> Result<Handle> {
        let mut inner = self.inner.lock();
        let Some(handle) = inner.names.remove(name) else {
            return_errno!(Errno::ENOENT);
        };
        if let Some(slot) = inner.slots.get_mut(handle.0 as usize - 1) {
            slot.name = None;
        }
        Ok(handle)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
