//! Modifiables: tracked cells that notify their readers on change.
//!
//! A [`Mod<T>`] holds a value and the set of read nodes that depend on it.
//! Writing a different value marks every registered reader as pending, which
//! is what a later [`Computation::propagate`](crate::Computation::propagate)
//! picks up. Writing an equal value notifies nobody.
//!
//! Inside a computation, modifiables are passed around as the non-owning
//! [`ModRef`] / [`ModSlice`] handles. The owner (user code, a [`ModArray`],
//! or a trace node's allocation list) must keep the cell at a stable address
//! for as long as any reader is registered; the owning containers here all
//! guarantee that, and destroying a modifiable with live readers is a debug
//! assertion.

use std::cell::UnsafeCell;
use std::marker::PhantomData;

#[cfg(debug_assertions)]
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;

use crate::reader_set::{ReaderPtr, ReaderSet};
use crate::scheduler;

/// Bound on values stored in modifiables.
///
/// Equality is what decides whether a write notifies readers, so types whose
/// values can compare equal while being observably different must supply a
/// discriminating `PartialEq`.
pub trait ModValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> ModValue for T {}

/// The untyped part of a modifiable: its reader set and debug state.
pub(crate) struct ModCore {
    readers: ReaderSet,
    #[cfg(debug_assertions)]
    written: AtomicBool,
}

impl ModCore {
    pub(crate) const fn new() -> Self {
        ModCore {
            readers: ReaderSet::new(),
            #[cfg(debug_assertions)]
            written: AtomicBool::new(false),
        }
    }

    pub(crate) fn add_reader(&self, reader: ReaderPtr) {
        #[cfg(debug_assertions)]
        debug_assert!(
            self.written.load(Ordering::Acquire),
            "reading a modifiable before its first write"
        );
        self.readers.insert(reader);
    }

    pub(crate) fn remove_reader(&self, reader: ReaderPtr) {
        self.readers.remove(reader);
    }

    /// Mark every registered reader as pending.
    pub(crate) fn notify_readers(&self) {
        self.readers.for_all(|reader| {
            // Safety: readers unregister in their destructor and trace
            // teardown is deferred past every notification phase, so the
            // pointer is live.
            unsafe { (*reader.0).set_modified() };
        });
    }

    #[cfg(debug_assertions)]
    fn mark_written(&self) {
        self.written.store(true, Ordering::Release);
    }
}

impl Drop for ModCore {
    fn drop(&mut self) {
        debug_assert!(
            self.readers.is_empty(),
            "modifiable destroyed while readers are still registered"
        );
    }
}

/// A tracked cell.
///
/// Reading one inside a recorded context (see
/// [`TraceContext::read`](crate::TraceContext::read)) registers the reading
/// node as a dependent; [`write`](Mod::write) marks those dependents pending
/// when the value actually changes.
pub struct Mod<T> {
    core: ModCore,
    value: UnsafeCell<T>,
}

// Safety: a modifiable's writes never race with its reads or with each
// other (the structure of the computation serializes them), so the value
// cell is only ever accessed exclusively; everything else is atomic.
unsafe impl<T: Send> Send for Mod<T> {}
unsafe impl<T: Send + Sync> Sync for Mod<T> {}

impl<T: ModValue> Mod<T> {
    /// A fresh, unwritten modifiable holding `T::default()`.
    ///
    /// Reading it before the first write is undefined.
    pub fn new() -> Self
    where
        T: Default,
    {
        Mod {
            core: ModCore::new(),
            value: UnsafeCell::new(T::default()),
        }
    }

    /// A modifiable seeded with `value`, as if freshly written.
    pub fn with_value(value: T) -> Self {
        let m = Mod {
            core: ModCore::new(),
            value: UnsafeCell::new(value),
        };
        #[cfg(debug_assertions)]
        m.core.mark_written();
        m
    }

    /// The current value, unrecorded.
    ///
    /// For inspection from outside the computation and for read-closure
    /// payloads; does not register a dependency.
    pub fn value(&self) -> T {
        // Safety: writes never race with reads, see type-level comment.
        unsafe { (*self.value.get()).clone() }
    }

    /// Set the value. If it differs from the current one, every registered
    /// reader is marked pending; writing an equal value is free.
    pub fn write(&self, value: T) {
        // Safety: writes never race with reads, see type-level comment.
        let changed = unsafe { *self.value.get() != value };
        if changed {
            unsafe {
                *self.value.get() = value;
            }
            self.core.notify_readers();
        }
        #[cfg(debug_assertions)]
        self.core.mark_written();
    }

    /// Non-owning handle for use inside computations.
    pub fn handle(&self) -> ModRef<T> {
        ModRef {
            ptr: self as *const Mod<T>,
        }
    }

    pub(crate) fn core(&self) -> &ModCore {
        &self.core
    }
}

impl<T: ModValue + Default> Default for Mod<T> {
    fn default() -> Self {
        Mod::new()
    }
}

/// Non-owning handle to a [`Mod`], the currency of recorded reads.
///
/// `Copy`, freely capturable by read closures. The referent must outlive
/// every trace node that reads through the handle; the runtime's ownership
/// discipline (allocation lists outlive their subtree, user-owned mods
/// outlive the computation) provides this.
pub struct ModRef<T> {
    ptr: *const Mod<T>,
}

impl<T> Clone for ModRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ModRef<T> {}

unsafe impl<T: Send + Sync> Send for ModRef<T> {}
unsafe impl<T: Send + Sync> Sync for ModRef<T> {}

impl<T: ModValue> ModRef<T> {
    fn get(&self) -> &Mod<T> {
        // Safety: outlives-every-reader contract, see type docs.
        unsafe { &*self.ptr }
    }

    /// The current value, unrecorded.
    pub fn value(&self) -> T {
        self.get().value()
    }

    /// Write through the handle; idempotent on equal values.
    pub fn write(&self, value: T) {
        self.get().write(value)
    }

    pub(crate) fn subscribe(&self, reader: ReaderPtr) {
        self.get().core().add_reader(reader);
    }

    pub(crate) fn unsubscribe(&self, reader: ReaderPtr) {
        self.get().core().remove_reader(reader);
    }

    pub(crate) fn raw_core(&self) -> RawMod {
        RawMod(self.get().core())
    }
}

impl<'a, T: ModValue> From<&'a Mod<T>> for ModRef<T> {
    fn from(m: &'a Mod<T>) -> Self {
        m.handle()
    }
}

/// Type-erased non-owning handle to a modifiable's core, used by scope reads
/// where one dependency list mixes value types. Ordered by address for the
/// reconciliation merge.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct RawMod(pub(crate) *const ModCore);

unsafe impl Send for RawMod {}
unsafe impl Sync for RawMod {}

impl RawMod {
    pub(crate) fn add_reader(&self, reader: ReaderPtr) {
        unsafe { (*self.0).add_reader(reader) };
    }

    pub(crate) fn remove_reader(&self, reader: ReaderPtr) {
        unsafe { (*self.0).remove_reader(reader) };
    }
}

/// Contiguous storage of `n` modifiables, initialized in parallel.
pub struct ModArray<T> {
    mods: Box<[Mod<T>]>,
}

impl<T: ModValue> ModArray<T> {
    /// `n` fresh, unwritten modifiables.
    pub fn new(n: usize) -> Self
    where
        T: Default,
    {
        let mods = scheduler::install(|| {
            (0..n)
                .into_par_iter()
                .map(|_| Mod::new())
                .collect::<Vec<_>>()
        });
        ModArray {
            mods: mods.into_boxed_slice(),
        }
    }

    /// `n` modifiables each seeded with `value`.
    pub fn with_value(n: usize, value: T) -> Self {
        let mods = scheduler::install(|| {
            (0..n)
                .into_par_iter()
                .map(|_| Mod::with_value(value.clone()))
                .collect::<Vec<_>>()
        });
        ModArray {
            mods: mods.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.mods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mods.is_empty()
    }

    /// Handle to the `i`-th modifiable.
    pub fn get(&self, i: usize) -> ModRef<T> {
        self.mods[i].handle()
    }

    /// Handle to the whole array.
    pub fn slice(&self) -> ModSlice<T> {
        ModSlice::from(&self.mods[..])
    }

    /// Handle to the sub-range `[lo, hi)`.
    pub fn range(&self, lo: usize, hi: usize) -> ModSlice<T> {
        ModSlice::from(&self.mods[lo..hi])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mod<T>> {
        self.mods.iter()
    }
}

impl<T: ModValue> std::ops::Index<usize> for ModArray<T> {
    type Output = Mod<T>;

    fn index(&self, i: usize) -> &Mod<T> {
        &self.mods[i]
    }
}

/// Non-owning handle to a contiguous range of same-typed modifiables.
pub struct ModSlice<T> {
    ptr: *const Mod<T>,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ModSlice<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ModSlice<T> {}

unsafe impl<T: Send + Sync> Send for ModSlice<T> {}
unsafe impl<T: Send + Sync> Sync for ModSlice<T> {}

impl<T: ModValue> ModSlice<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handle to the `i`-th modifiable of the range.
    pub fn get(&self, i: usize) -> ModRef<T> {
        debug_assert!(i < self.len);
        ModRef {
            ptr: unsafe { self.ptr.add(i) },
        }
    }

    /// Sub-range `[lo, hi)` of this range.
    pub fn range(&self, lo: usize, hi: usize) -> ModSlice<T> {
        debug_assert!(lo <= hi && hi <= self.len);
        ModSlice {
            ptr: unsafe { self.ptr.add(lo) },
            len: hi - lo,
            _marker: PhantomData,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = ModRef<T>> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }
}

impl<'a, T: ModValue> From<&'a [Mod<T>]> for ModSlice<T> {
    fn from(mods: &'a [Mod<T>]) -> Self {
        ModSlice {
            ptr: mods.as_ptr(),
            len: mods.len(),
            _marker: PhantomData,
        }
    }
}
