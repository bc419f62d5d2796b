//! Per-node dynamic allocation lists.
//!
//! Modifiables obtained through
//! [`TraceContext::alloc`](crate::TraceContext::alloc) /
//! [`alloc_array`](crate::TraceContext::alloc_array) are owned by the trace
//! node that was current at the allocation. The node destroys its list
//! strictly after its children, so any read dependency rooted inside the
//! node is unregistered before the modifiable it points at goes away.

use std::any::Any;

use crate::modifiable::{Mod, ModArray, ModRef, ModSlice, ModValue};

/// LIFO of type-erased allocations owned by one trace node.
///
/// Each entry is individually boxed, so the addresses handed out as
/// [`ModRef`] / [`ModSlice`] stay stable while the list grows.
#[derive(Default)]
pub(crate) struct AllocList {
    entries: Vec<Box<dyn Any + Send>>,
}

impl AllocList {
    pub(crate) fn push_mod<T: ModValue + Default>(&mut self) -> ModRef<T> {
        let boxed = Box::new(Mod::<T>::new());
        let handle = boxed.handle();
        self.entries.push(boxed);
        handle
    }

    pub(crate) fn push_array<T: ModValue + Default>(&mut self, n: usize) -> ModSlice<T> {
        let boxed = Box::new(ModArray::<T>::new(n));
        let handle = boxed.slice();
        self.entries.push(boxed);
        handle
    }

}

impl Drop for AllocList {
    fn drop(&mut self) {
        // Back-to-front, reverse allocation order.
        while self.entries.pop().is_some() {}
    }
}
