//! Series-Parallel trace nodes and change propagation.
//!
//! A recorded computation is a tree of nodes: series nodes order their two
//! children, parallel nodes run them in parallel, read nodes hold a closure
//! and the dependency set it read. Each node owns its children, its list of
//! dynamically allocated modifiables, and a non-owning pointer to its parent.
//!
//! The dirty bit on a node means "some descendant has a pending update".
//! Markers (writers) and clearers (the propagator) race benignly on it:
//! release on store, acquire on load.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::alloc::AllocList;
use crate::gc::GarbageCollector;
use crate::reader_set::ReaderPtr;
use crate::scheduler;

/// An owning child link. Empty slots are materialized lazily by the builder.
pub(crate) type Slot = Option<Box<Node>>;

/// Raw node pointer that may cross a fork. The pointee is heap-allocated and
/// outlives the fork by tree ownership.
#[derive(Clone, Copy)]
pub(crate) struct NodePtr(pub(crate) *const Node);

unsafe impl Send for NodePtr {}
unsafe impl Sync for NodePtr {}

/// The closure-and-dependencies payload of a read node, type-erased.
///
/// `execute` runs with the cursor sitting at the read node itself, so the
/// subtree the closure records lands in the node's left slot and the node's
/// right slot becomes the continuation.
pub(crate) trait ReadBody: Send {
    fn execute(&mut self, slot: &mut Slot);

    /// Subscribe `reader` to the captured dependencies. Called once, right
    /// after the owning node is allocated. Scope bodies subscribe during
    /// `execute` instead.
    fn register(&mut self, reader: ReaderPtr);

    /// Unsubscribe `reader` from every current dependency. Called once, at
    /// node teardown.
    fn unregister(&mut self, reader: ReaderPtr);
}

/// Mutable state of a read node.
pub(crate) struct ReadState {
    /// The node's own dependencies changed; re-execute on propagate.
    pending: AtomicBool,
    /// Absent only while the closure is running.
    body: Option<Box<dyn ReadBody>>,
}

impl ReadState {
    pub(crate) fn new(body: Box<dyn ReadBody>) -> Self {
        ReadState {
            pending: AtomicBool::new(false),
            body: Some(body),
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Subscribe the owning node to the body's dependencies; called once,
    /// right after the node is allocated at its final address.
    pub(crate) fn register_reader(&mut self, reader: ReaderPtr) {
        self.body
            .as_mut()
            .expect("read body present at registration")
            .register(reader);
    }

    fn clear_pending(&self) {
        self.pending.store(false, Ordering::Release);
    }

    /// Take the body out of the node in `slot`, run it with the cursor at
    /// that node, and put it back. The body cannot be called in place: it
    /// rebuilds the subtree of the very node that stores it.
    pub(crate) fn execute_in(slot: &mut Slot) {
        let mut body = {
            let node = slot.as_deref_mut().expect("read node in slot");
            match &mut node.kind {
                NodeKind::Read(rs) => rs.body.take().expect("read body in use"),
                _ => unreachable!("execute_in on a non-read node"),
            }
        };
        body.execute(slot);
        let node = slot.as_deref_mut().expect("read node in slot");
        match &mut node.kind {
            NodeKind::Read(rs) => rs.body = Some(body),
            _ => unreachable!("read node changed kind during execution"),
        }
    }
}

pub(crate) enum NodeKind {
    /// Ordered composition: left completes before right begins.
    Series,
    /// Left and right execute (and re-execute) in parallel.
    Parallel,
    /// A recorded read; left holds the subtree its closure built.
    Read(ReadState),
}

/// One node of the SP-trace tree.
pub(crate) struct Node {
    /// Non-owning; null for roots and graveyard nodes. Immutable after
    /// construction, so it may be chased concurrently with tree surgery
    /// elsewhere.
    parent: *const Node,
    dirty: AtomicBool,
    pub(crate) kind: NodeKind,
    pub(crate) left: Slot,
    pub(crate) right: Slot,
    pub(crate) allocs: AllocList,
}

// Safety: nodes move between workers only with exclusive access (&mut or
// ownership); the fields touched through shared raw pointers (`dirty`,
// read `pending`, `parent`) are atomic or immutable.
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    pub(crate) fn new(kind: NodeKind, parent: *const Node) -> Node {
        Node {
            parent,
            dirty: AtomicBool::new(false),
            kind,
            left: None,
            right: None,
            allocs: AllocList::default(),
        }
    }

    pub(crate) fn boxed_series(parent: *const Node) -> Box<Node> {
        Box::new(Node::new(NodeKind::Series, parent))
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Called through reader sets when a dependency of this read node
    /// changed: raise the pending flag, then mark the path to the root
    /// dirty. Stops at the first already-dirty ancestor, so concurrent
    /// writers race monotonically.
    pub(crate) fn set_modified(&self) {
        if let NodeKind::Read(rs) = &self.kind {
            rs.pending.store(true, Ordering::Release);
        }
        let mut cur: *const Node = self;
        loop {
            // Safety: ancestors are kept alive by tree ownership; detached
            // subtrees keep their parents alive through deferred
            // reclamation until the next quiescent collection.
            let node = unsafe { &*cur };
            if node.dirty.swap(true, Ordering::AcqRel) {
                break;
            }
            if node.parent.is_null() {
                break;
            }
            cur = node.parent;
        }
    }

    /// Replace the left child, deferring destruction of the old subtree.
    pub(crate) fn replace_left(&mut self, node: Slot) {
        if let Some(old) = mem::replace(&mut self.left, node) {
            GarbageCollector::add(old);
        }
    }

    /// Nodes in this subtree.
    pub(crate) fn count_nodes(&self) -> usize {
        1 + self.left.as_deref().map_or(0, Node::count_nodes)
            + self.right.as_deref().map_or(0, Node::count_nodes)
    }

    /// Bytes held by this subtree's nodes and read closures.
    pub(crate) fn memory_bytes(&self) -> usize {
        let own = mem::size_of::<Node>()
            + match &self.kind {
                NodeKind::Read(rs) => rs.body.as_deref().map_or(0, |b| mem::size_of_val(b)),
                _ => 0,
            };
        own + self.left.as_deref().map_or(0, Node::memory_bytes)
            + self.right.as_deref().map_or(0, Node::memory_bytes)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // Unsubscribe from dependencies first, then destroy children, and
        // only then (as the fields drop) this node's own allocations: any
        // reader registered inside the subtree unregisters while the
        // modifiable it read still exists.
        let me: *const Node = self;
        if let NodeKind::Read(rs) = &mut self.kind {
            if let Some(body) = rs.body.as_mut() {
                body.unregister(ReaderPtr(me));
            }
        }
        match (self.left.take(), self.right.take()) {
            (Some(left), Some(right)) => {
                if matches!(self.kind, NodeKind::Parallel) {
                    scheduler::par_do(move || drop(left), move || drop(right));
                } else {
                    drop(left);
                    drop_spine(right);
                }
            }
            (Some(child), None) | (None, Some(child)) => drop_spine(child),
            (None, None) => {}
        }
    }
}

/// Tear down a chain iteratively along the right spine; sequential code
/// records arbitrarily long series chains, which would otherwise recurse
/// one frame per recorded operation.
fn drop_spine(mut node: Box<Node>) {
    loop {
        let next = node.right.take();
        drop(node);
        match next {
            Some(n) => node = n,
            None => break,
        }
    }
}

/// Push pending updates through the subtree rooted in `slot`.
pub(crate) fn propagate_slot(slot: &mut Slot) {
    // A read node whose own dependencies changed re-executes in place;
    // everything else descends into dirty children.
    let pending = match slot.as_deref() {
        Some(node) => match &node.kind {
            NodeKind::Read(rs) => rs.is_pending(),
            _ => false,
        },
        None => return,
    };
    if pending {
        reexecute(slot);
        return;
    }

    let node = slot.as_deref_mut().expect("slot checked non-empty");
    if !node.is_dirty() {
        return;
    }
    let parallel = matches!(node.kind, NodeKind::Parallel);
    {
        let Node { left, right, .. } = &mut *node;
        if parallel {
            let left_dirty = left.as_deref().map_or(false, Node::is_dirty);
            let right_dirty = right.as_deref().map_or(false, Node::is_dirty);
            if !left_dirty {
                propagate_slot(right);
            } else if !right_dirty {
                propagate_slot(left);
            } else {
                scheduler::par_do(move || propagate_slot(left), move || propagate_slot(right));
            }
        } else {
            // Series (and read nodes with clean pending): left completes
            // before right begins, preserving recorded effect order.
            propagate_slot(left);
            propagate_slot(right);
        }
    }
    node.clear_dirty();
}

/// Re-run the read closure of the node in `slot`.
///
/// The current children and allocations move onto a detached graveyard node
/// on this worker's reclamation pile; readers inside them stay registered
/// until the next [`GarbageCollector::run`], which is what makes concurrent
/// notifications safe against the teardown.
fn reexecute(slot: &mut Slot) {
    {
        let node = slot.as_deref_mut().expect("re-executing an empty slot");
        let mut graveyard = Box::new(Node::new(NodeKind::Series, ptr::null()));
        graveyard.left = node.left.take();
        graveyard.right = node.right.take();
        graveyard.allocs = mem::take(&mut node.allocs);
        GarbageCollector::add(graveyard);
    }

    ReadState::execute_in(slot);

    let node = slot.as_deref_mut().expect("read node survived re-execution");
    if let NodeKind::Read(rs) = &node.kind {
        rs.clear_pending();
    }
    node.clear_dirty();
}
