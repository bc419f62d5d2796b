//! The trace builder.
//!
//! A self-adjusting function is an ordinary function taking `&mut
//! TraceContext`; every primitive it issues appends nodes at the current
//! cursor position. The cursor is a slot (an owning child link, possibly
//! still empty) plus the parent to attach a node to when the slot has to be
//! materialized. Read nodes always land in the current node's left slot;
//! the right slot then becomes the continuation for whatever the function
//! does next, so sequential code produces a right-leaning series chain.
//!
//! Composition needs no special form: calling another self-adjusting
//! function with the same context inlines its trace at the cursor.
//!
//! ```ignore
//! fn double_plus_one(ctx: &mut TraceContext, a: ModRef<i64>, out: ModRef<i64>) {
//!     ctx.read(a, move |ctx, x| {
//!         let tmp = ctx.alloc::<i64>();
//!         ctx.write(tmp, 2 * x);
//!         ctx.read(tmp, move |ctx, y| ctx.write(out, y + 1));
//!     });
//! }
//! ```

use crate::modifiable::{ModRef, ModSlice, ModValue, RawMod};
use crate::node::{Node, NodeKind, NodePtr, ReadBody, ReadState, Slot};
use crate::reader_set::ReaderPtr;
use crate::scheduler;

mod sealed {
    use crate::reader_set::ReaderPtr;

    /// Reader registration plumbing for dependency tuples; not implementable
    /// outside the crate.
    pub trait Subscribe {
        fn subscribe_all(&self, reader: ReaderPtr);
        fn unsubscribe_all(&self, reader: ReaderPtr);
    }
}

use sealed::Subscribe;

/// A statically-known dependency set: one modifiable handle or a tuple of
/// them (up to four), possibly of different value types.
pub trait ReadMods: Subscribe + Copy + Send + 'static {
    /// What the read closure receives: the current value(s).
    type Values;

    /// Snapshot the current values.
    fn values(&self) -> Self::Values;
}

impl<T: ModValue> Subscribe for ModRef<T> {
    fn subscribe_all(&self, reader: ReaderPtr) {
        self.subscribe(reader);
    }

    fn unsubscribe_all(&self, reader: ReaderPtr) {
        self.unsubscribe(reader);
    }
}

impl<T: ModValue> ReadMods for ModRef<T> {
    type Values = T;

    fn values(&self) -> T {
        self.value()
    }
}

macro_rules! impl_read_mods_tuple {
    ($($m:ident . $idx:tt),+) => {
        impl<$($m: ReadMods),+> Subscribe for ($($m,)+) {
            fn subscribe_all(&self, reader: ReaderPtr) {
                $(self.$idx.subscribe_all(reader);)+
            }

            fn unsubscribe_all(&self, reader: ReaderPtr) {
                $(self.$idx.unsubscribe_all(reader);)+
            }
        }

        impl<$($m: ReadMods),+> ReadMods for ($($m,)+) {
            type Values = ($($m::Values,)+);

            fn values(&self) -> Self::Values {
                ($(self.$idx.values(),)+)
            }
        }
    };
}

impl_read_mods_tuple!(M0.0);
impl_read_mods_tuple!(M0.0, M1.1);
impl_read_mods_tuple!(M0.0, M1.1, M2.2);
impl_read_mods_tuple!(M0.0, M1.1, M2.2, M3.3);

/// The trace cursor handed to self-adjusting functions.
pub struct TraceContext<'t> {
    /// The slot the next node lands in. `None` only transiently while a
    /// primitive is repositioning the cursor.
    slot: Option<&'t mut Slot>,
    /// Parent for materializing a series node when the slot is empty.
    parent: *const Node,
}

impl<'t> TraceContext<'t> {
    /// Cursor at `slot`, which already holds the node to build under.
    pub(crate) fn at(slot: &'t mut Slot) -> TraceContext<'t> {
        TraceContext {
            slot: Some(slot),
            parent: std::ptr::null(),
        }
    }

    /// Take the cursor slot, materializing a series node if it is empty.
    fn take_cursor(&mut self) -> &'t mut Box<Node> {
        let slot = self.slot.take().expect("trace cursor in use");
        if slot.is_none() {
            debug_assert!(!self.parent.is_null());
            *slot = Some(Node::boxed_series(self.parent));
        }
        slot.as_mut().expect("slot just materialized")
    }

    /// Like [`take_cursor`](Self::take_cursor) but leaves the cursor where
    /// it is, for primitives that do not append trace nodes.
    fn current_node(&mut self) -> &mut Node {
        let slot = self.slot.as_deref_mut().expect("trace cursor in use");
        if slot.is_none() {
            debug_assert!(!self.parent.is_null());
            *slot = Some(Node::boxed_series(self.parent));
        }
        slot.as_deref_mut().expect("slot just materialized")
    }

    /// Move the cursor to `node`'s right slot; `node` becomes the parent.
    fn advance(&mut self, node: &'t mut Box<Node>) {
        self.parent = &**node;
        self.slot = Some(&mut node.right);
    }

    fn attach_read(&mut self, body: Box<dyn ReadBody>) {
        let cur = self.take_cursor();
        let mut node = Box::new(Node::new(
            NodeKind::Read(ReadState::new(body)),
            &**cur as *const Node,
        ));
        let reader = ReaderPtr(&*node);
        if let NodeKind::Read(rs) = &mut node.kind {
            rs.register_reader(reader);
        }
        cur.replace_left(Some(node));
        ReadState::execute_in(&mut cur.left);
        self.advance(cur);
    }

    /// Record a read of a fixed set of modifiables.
    ///
    /// `body` runs now with the current values and re-runs during
    /// propagation whenever one of them changes, replacing the subtree it
    /// recorded.
    pub fn read<M, F>(&mut self, mods: M, body: F)
    where
        M: ReadMods,
        F: FnMut(&mut TraceContext, M::Values) + Send + 'static,
    {
        self.attach_read(Box::new(TupleBody { mods, f: body }));
    }

    /// Record a read of a contiguous range of same-typed modifiables; the
    /// closure receives all their values.
    pub fn read_array<T, F>(&mut self, mods: ModSlice<T>, body: F)
    where
        T: ModValue,
        F: FnMut(&mut TraceContext, &[T]) + Send + 'static,
    {
        self.attach_read(Box::new(ArrayBody { mods, f: body }));
    }

    /// Record a read whose dependency set is discovered by running the
    /// closure: every [`DynReads::read`] both returns the current value and
    /// registers the dependency. On re-execution the new set is reconciled
    /// with the old one by a merge, so dependencies kept across runs are
    /// not churned through unsubscribe/resubscribe.
    pub fn dynamic_scope<F>(&mut self, body: F)
    where
        F: FnMut(&mut TraceContext, &mut DynReads) + Send + 'static,
    {
        self.attach_read(Box::new(ScopeBody {
            f: body,
            deps: Vec::new(),
        }));
    }

    /// Record a parallel composition: `left` and `right` build (and later
    /// re-execute) in parallel. No ordering between the two branches may be
    /// assumed.
    pub fn par<L, R>(&mut self, left: L, right: R)
    where
        L: FnOnce(&mut TraceContext) + Send,
        R: FnOnce(&mut TraceContext) + Send,
    {
        let cur = self.take_cursor();
        let mut pnode = Box::new(Node::new(NodeKind::Parallel, &**cur as *const Node));
        let p_ptr: *const Node = &*pnode;
        pnode.left = Some(Node::boxed_series(p_ptr));
        pnode.right = Some(Node::boxed_series(p_ptr));
        cur.replace_left(Some(pnode));
        {
            let pnode = cur.left.as_deref_mut().expect("parallel node just attached");
            let Node {
                left: left_slot,
                right: right_slot,
                ..
            } = &mut *pnode;
            scheduler::par_do(
                move || {
                    let mut ctx = TraceContext::at(left_slot);
                    left(&mut ctx);
                },
                move || {
                    let mut ctx = TraceContext::at(right_slot);
                    right(&mut ctx);
                },
            );
        }
        self.advance(cur);
    }

    /// Record a balanced parallel loop over `[lo, hi)`: parallel nodes down
    /// to `granularity` indices, series chains below. An empty range
    /// records nothing.
    pub fn parallel_for<F>(&mut self, lo: usize, hi: usize, granularity: usize, body: F)
    where
        F: Fn(&mut TraceContext, usize) + Sync,
    {
        if lo >= hi {
            return;
        }
        let granularity = granularity.max(1);
        let cur = self.take_cursor();
        let subtree = build_par_loop(NodePtr(&**cur), lo, hi, granularity, &body);
        cur.replace_left(Some(subtree));
        self.advance(cur);
    }

    /// A fresh modifiable owned by the current trace node, destroyed with
    /// it. It outlives every read dependency recorded inside this node.
    pub fn alloc<T: ModValue + Default>(&mut self) -> ModRef<T> {
        self.current_node().allocs.push_mod()
    }

    /// Like [`alloc`](Self::alloc), for an array of `n` modifiables.
    pub fn alloc_array<T: ModValue + Default>(&mut self, n: usize) -> ModSlice<T> {
        self.current_node().allocs.push_array(n)
    }

    /// Write a modifiable; identical to [`ModRef::write`], provided so
    /// self-adjusting code reads uniformly.
    pub fn write<T: ModValue>(&self, m: ModRef<T>, value: T) {
        m.write(value);
    }
}

/// Dependency collector passed to [`TraceContext::dynamic_scope`] closures.
pub struct DynReads {
    deps: Vec<RawMod>,
}

impl DynReads {
    /// Read a modifiable's current value and record the dependency.
    pub fn read<T: ModValue>(&mut self, m: ModRef<T>) -> T {
        self.deps.push(m.raw_core());
        m.value()
    }
}

struct TupleBody<M, F> {
    mods: M,
    f: F,
}

impl<M, F> ReadBody for TupleBody<M, F>
where
    M: ReadMods,
    F: FnMut(&mut TraceContext, M::Values) + Send + 'static,
{
    fn execute(&mut self, slot: &mut Slot) {
        let values = self.mods.values();
        let mut ctx = TraceContext::at(slot);
        (self.f)(&mut ctx, values);
    }

    fn register(&mut self, reader: ReaderPtr) {
        self.mods.subscribe_all(reader);
    }

    fn unregister(&mut self, reader: ReaderPtr) {
        self.mods.unsubscribe_all(reader);
    }
}

struct ArrayBody<T, F> {
    mods: ModSlice<T>,
    f: F,
}

impl<T, F> ReadBody for ArrayBody<T, F>
where
    T: ModValue,
    F: FnMut(&mut TraceContext, &[T]) + Send + 'static,
{
    fn execute(&mut self, slot: &mut Slot) {
        let values: Vec<T> = self.mods.iter().map(|m| m.value()).collect();
        let mut ctx = TraceContext::at(slot);
        (self.f)(&mut ctx, &values);
    }

    fn register(&mut self, reader: ReaderPtr) {
        for m in self.mods.iter() {
            m.subscribe(reader);
        }
    }

    fn unregister(&mut self, reader: ReaderPtr) {
        for m in self.mods.iter() {
            m.unsubscribe(reader);
        }
    }
}

struct ScopeBody<F> {
    f: F,
    /// Current dependency set, address-ordered and deduplicated.
    deps: Vec<RawMod>,
}

impl<F> ReadBody for ScopeBody<F>
where
    F: FnMut(&mut TraceContext, &mut DynReads) + Send + 'static,
{
    fn execute(&mut self, slot: &mut Slot) {
        let reader = ReaderPtr(&**slot.as_ref().expect("scope node in slot"));
        let mut reads = DynReads { deps: Vec::new() };
        {
            let mut ctx = TraceContext::at(slot);
            (self.f)(&mut ctx, &mut reads);
        }
        let mut new_deps = reads.deps;
        new_deps.sort_unstable();
        new_deps.dedup();

        // Merge against the previous set: subscribe only to newly read
        // mods, unsubscribe only from mods no longer read.
        let old_deps = &self.deps;
        let (mut i, mut j) = (0, 0);
        while i < old_deps.len() || j < new_deps.len() {
            if i == old_deps.len() {
                new_deps[j].add_reader(reader);
                j += 1;
            } else if j == new_deps.len() {
                old_deps[i].remove_reader(reader);
                i += 1;
            } else if old_deps[i] == new_deps[j] {
                i += 1;
                j += 1;
            } else if old_deps[i] < new_deps[j] {
                old_deps[i].remove_reader(reader);
                i += 1;
            } else {
                new_deps[j].add_reader(reader);
                j += 1;
            }
        }
        self.deps = new_deps;
    }

    fn register(&mut self, _reader: ReaderPtr) {
        // Scope bodies discover their dependencies while running; the first
        // execute subscribes via the merge against the empty previous set.
    }

    fn unregister(&mut self, reader: ReaderPtr) {
        for dep in &self.deps {
            dep.remove_reader(reader);
        }
    }
}

fn build_par_loop<F>(parent: NodePtr, lo: usize, hi: usize, granularity: usize, f: &F) -> Box<Node>
where
    F: Fn(&mut TraceContext, usize) + Sync,
{
    if hi - lo <= granularity {
        build_seq_loop(parent, lo, hi, f)
    } else {
        let mut node = Box::new(Node::new(NodeKind::Parallel, parent.0));
        let p = NodePtr(&*node);
        let mid = lo + (hi - lo) / 2;
        let (left, right) = scheduler::par_do(
            move || build_par_loop(p, lo, mid, granularity, f),
            move || build_par_loop(p, mid, hi, granularity, f),
        );
        node.left = Some(left);
        node.right = Some(right);
        node
    }
}

fn build_seq_loop<F>(parent: NodePtr, lo: usize, hi: usize, f: &F) -> Box<Node>
where
    F: Fn(&mut TraceContext, usize) + Sync,
{
    if lo + 1 == hi {
        let mut slot: Slot = Some(Node::boxed_series(parent.0));
        {
            let mut ctx = TraceContext::at(&mut slot);
            f(&mut ctx, lo);
        }
        slot.expect("loop leaf still populated")
    } else {
        let mut node = Node::boxed_series(parent.0);
        let p = NodePtr(&*node);
        let mid = lo + (hi - lo) / 2;
        node.left = Some(build_seq_loop(p, lo, mid, f));
        node.right = Some(build_seq_loop(p, mid, hi, f));
        node
    }
}
