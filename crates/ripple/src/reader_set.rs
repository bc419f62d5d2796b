//! Concurrent reader sets.
//!
//! Every modifiable carries a set of the read nodes that depend on it. Most
//! modifiables have exactly one reader, so the set stores a single reader
//! inline in one machine word with no allocation; under multiple readers it
//! converts itself into a concurrent binary tree keyed by a hash of the
//! reader pointer, so the shape is independent of insertion history.
//!
//! `insert` and `remove` may run concurrently with each other (parallel
//! reads firing during one re-execution do exactly that), but not with
//! [`ReaderSet::for_all`]. The caller upholds this: `for_all` only runs
//! inside a write, and writes to a modifiable never race with that
//! modifiable's reads by the structure of the computation.

use std::hash::BuildHasher;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::node::Node;
use crate::scheduler;

/// Below this many readers, traversal, rebuild and teardown stay sequential.
const READER_TREE_GRANULARITY: usize = 1024;

/// Low tag bit distinguishing a tree root from an inline single reader.
const TAG: usize = 1;

/// Non-owning pointer to a read node registered in a reader set.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ReaderPtr(pub(crate) *const Node);

// Reader pointers are shared across workers during parallel traversal; the
// pointees are trace nodes whose notified fields are all atomic.
unsafe impl Send for ReaderPtr {}
unsafe impl Sync for ReaderPtr {}

fn hash_reader(reader: ReaderPtr) -> u64 {
    // Fixed seeds: the same reader must land on the same key for the whole
    // process so that removals can retrace the insertion path.
    ahash::RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    )
    .hash_one(reader.0 as usize)
}

struct TreeNode {
    key: u64,
    reader: ReaderPtr,
    left: AtomicPtr<TreeNode>,
    right: AtomicPtr<TreeNode>,
    /// Live-subtree size, computed during `for_all` only.
    size: AtomicUsize,
    /// Lazy deletion mark; reaped on the next `for_all`.
    deleted: AtomicBool,
}

unsafe impl Send for TreeNode {}
unsafe impl Sync for TreeNode {}

impl TreeNode {
    fn new(reader: ReaderPtr) -> Self {
        TreeNode {
            key: hash_reader(reader),
            reader,
            left: AtomicPtr::new(ptr::null_mut()),
            right: AtomicPtr::new(ptr::null_mut()),
            size: AtomicUsize::new(1),
            deleted: AtomicBool::new(false),
        }
    }
}

/// Hybrid single/tree concurrent set of reader pointers.
///
/// State word: `0` when empty; a read-node pointer (tag bit clear) when a
/// single reader is stored inline; a tree-node pointer with the tag bit set
/// otherwise.
pub(crate) struct ReaderSet {
    state: AtomicUsize,
}

fn untag(state: usize) -> *mut TreeNode {
    (state & !TAG) as *mut TreeNode
}

impl ReaderSet {
    pub(crate) const fn new() -> Self {
        ReaderSet {
            state: AtomicUsize::new(0),
        }
    }

    /// Add a reader. Safe to run concurrently with `insert`/`remove`.
    pub(crate) fn insert(&self, reader: ReaderPtr) {
        debug_assert!(!reader.0.is_null());
        loop {
            let cur = self.state.load(Ordering::Acquire);
            if cur == 0 {
                // Empty -> single.
                if self
                    .state
                    .compare_exchange(0, reader.0 as usize, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
            } else if cur & TAG == 0 {
                // Single -> tree holding the current single reader, then
                // insert ours into the tree.
                let root = Box::into_raw(Box::new(TreeNode::new(ReaderPtr(cur as *const Node))));
                if self
                    .state
                    .compare_exchange(
                        cur,
                        root as usize | TAG,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.insert_tree(reader);
                    return;
                }
                // Lost the race; whoever won changed the state, retry on it.
                drop(unsafe { Box::from_raw(root) });
            } else {
                self.insert_tree(reader);
                return;
            }
        }
    }

    fn insert_tree(&self, reader: ReaderPtr) {
        let new_node = Box::into_raw(Box::new(TreeNode::new(reader)));
        let key = unsafe { (*new_node).key };
        let cur = self.state.load(Ordering::Acquire);
        // Tree -> single / empty transitions only happen in `for_all`, which
        // never runs concurrently with inserts, so the state stays a tree.
        debug_assert!(cur & TAG != 0);
        let mut node = unsafe { &*untag(cur) };
        loop {
            let child = if key <= node.key {
                &node.left
            } else {
                &node.right
            };
            let existing = child.load(Ordering::Acquire);
            if existing.is_null() {
                match child.compare_exchange(
                    ptr::null_mut(),
                    new_node,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return,
                    Err(winner) => node = unsafe { &*winner },
                }
            } else {
                node = unsafe { &*existing };
            }
        }
    }

    /// Remove a reader. In tree state the removal is lazy: the node is
    /// marked and physically reaped by the next `for_all`.
    pub(crate) fn remove(&self, reader: ReaderPtr) {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            debug_assert!(cur != 0, "removing a reader from an empty reader set");
            if cur & TAG == 0 {
                debug_assert_eq!(cur, reader.0 as usize);
                // Single -> empty.
                if self
                    .state
                    .compare_exchange(cur, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                // A concurrent insert converted us to a tree; fall through.
            } else {
                self.remove_tree(reader);
                return;
            }
        }
    }

    fn remove_tree(&self, reader: ReaderPtr) {
        let key = hash_reader(reader);
        let cur = self.state.load(Ordering::Acquire);
        debug_assert!(cur & TAG != 0);
        let mut node = untag(cur) as *const TreeNode;
        while !node.is_null() {
            let n = unsafe { &*node };
            if n.reader == reader {
                n.deleted.store(true, Ordering::Release);
                return;
            }
            node = if key <= n.key {
                n.left.load(Ordering::Acquire)
            } else {
                n.right.load(Ordering::Acquire)
            };
        }
        debug_assert!(false, "reader not found in reader set");
    }

    /// Apply `f` to every reader in the set.
    ///
    /// Must not run concurrently with `insert`/`remove`. Reaps lazily
    /// deleted readers and rebuilds the tree balanced; a set that shrank to
    /// one or zero readers collapses back to the inline states.
    pub(crate) fn for_all<F>(&self, f: F)
    where
        F: Fn(ReaderPtr) + Sync,
    {
        let cur = self.state.load(Ordering::Acquire);
        if cur == 0 {
            return;
        }
        if cur & TAG == 0 {
            f(ReaderPtr(cur as *const Node));
            return;
        }

        let root = untag(cur);
        let size = compute_size(unsafe { &*root });
        let mut flattened = vec![ReaderPtr(ptr::null()); size];
        flatten(unsafe { &*root }, &mut flattened);

        if size <= READER_TREE_GRANULARITY {
            for &reader in &flattened {
                f(reader);
            }
        } else {
            scheduler::parallel_for(0, size, READER_TREE_GRANULARITY, |i| f(flattened[i]));
        }

        drop_tree(TreePtr(root));

        match size {
            0 => self.state.store(0, Ordering::Release),
            1 => self.state.store(flattened[0].0 as usize, Ordering::Release),
            _ => {
                let new_root = build_tree(&flattened);
                self.state.store(new_root.0 as usize | TAG, Ordering::Release);
            }
        }
    }

    /// Whether the set is empty. Performs pending lazy deletions first, so
    /// it must not run concurrently with any other operation.
    pub(crate) fn is_empty(&self) -> bool {
        self.for_all(|_| {});
        self.state.load(Ordering::Acquire) == 0
    }
}

impl Drop for ReaderSet {
    fn drop(&mut self) {
        let cur = *self.state.get_mut();
        if cur & TAG != 0 {
            drop_tree(TreePtr(untag(cur)));
        }
    }
}

/// Compute and record live-subtree sizes, in parallel for branchy trees.
fn compute_size(node: &TreeNode) -> usize {
    let left = node.left.load(Ordering::Relaxed);
    let right = node.right.load(Ordering::Relaxed);
    let alive = !node.deleted.load(Ordering::Relaxed) as usize;
    let total = match (left.is_null(), right.is_null()) {
        (true, true) => alive,
        (false, true) => alive + compute_size(unsafe { &*left }),
        (true, false) => alive + compute_size(unsafe { &*right }),
        (false, false) => {
            let (left, right) = unsafe { (&*left, &*right) };
            let (l, r) = scheduler::par_do(|| compute_size(left), || compute_size(right));
            alive + l + r
        }
    };
    node.size.store(total, Ordering::Relaxed);
    total
}

/// Write the live readers of `node`'s subtree into `buffer` in key order.
/// Relies on the sizes recorded by [`compute_size`].
fn flatten(node: &TreeNode, buffer: &mut [ReaderPtr]) {
    let left = node.left.load(Ordering::Relaxed);
    let right = node.right.load(Ordering::Relaxed);
    let alive = !node.deleted.load(Ordering::Relaxed) as usize;
    let left_size = if left.is_null() {
        0
    } else {
        unsafe { (*left).size.load(Ordering::Relaxed) }
    };
    let (left_buf, rest) = buffer.split_at_mut(left_size);
    let (own, right_buf) = rest.split_at_mut(alive);
    if alive == 1 {
        own[0] = node.reader;
    }
    match (left.is_null(), right.is_null()) {
        (true, true) => {}
        (false, true) => flatten(unsafe { &*left }, left_buf),
        (true, false) => flatten(unsafe { &*right }, right_buf),
        (false, false) => {
            let (left, right) = unsafe { (&*left, &*right) };
            scheduler::par_do(|| flatten(left, left_buf), || flatten(right, right_buf));
        }
    }
}

/// Owning tree pointer that may cross a fork during rebuild and teardown.
#[derive(Clone, Copy)]
struct TreePtr(*mut TreeNode);

unsafe impl Send for TreePtr {}

/// Build a balanced tree over `readers` (non-empty, in key order).
fn build_tree(readers: &[ReaderPtr]) -> TreePtr {
    debug_assert!(!readers.is_empty());
    let mid = readers.len() / 2;
    let root = Box::into_raw(Box::new(TreeNode::new(readers[mid])));
    let node = unsafe { &*root };
    node.size.store(readers.len(), Ordering::Relaxed);
    let (left, right) = (&readers[..mid], &readers[mid + 1..]);
    let build = |part: &[ReaderPtr]| {
        if part.is_empty() {
            TreePtr(ptr::null_mut())
        } else {
            build_tree(part)
        }
    };
    if readers.len() <= READER_TREE_GRANULARITY {
        node.left.store(build(left).0, Ordering::Relaxed);
        node.right.store(build(right).0, Ordering::Relaxed);
    } else {
        let (l, r) = scheduler::par_do(|| build(left), || build(right));
        node.left.store(l.0, Ordering::Relaxed);
        node.right.store(r.0, Ordering::Relaxed);
    }
    TreePtr(root)
}

/// Tear a tree down, in parallel when the recorded size is large.
fn drop_tree(node: TreePtr) {
    let boxed = unsafe { Box::from_raw(node.0) };
    let left = TreePtr(boxed.left.load(Ordering::Relaxed));
    let right = TreePtr(boxed.right.load(Ordering::Relaxed));
    match (left.0.is_null(), right.0.is_null()) {
        (true, true) => {}
        (false, true) => drop_tree(left),
        (true, false) => drop_tree(right),
        (false, false) => {
            if boxed.size.load(Ordering::Relaxed) >= READER_TREE_GRANULARITY {
                scheduler::par_do(move || drop_tree(left), move || drop_tree(right));
            } else {
                drop_tree(left);
                drop_tree(right);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeKind};
    use std::sync::atomic::AtomicUsize;

    fn dummy_readers(n: usize) -> Vec<Box<Node>> {
        (0..n)
            .map(|_| Box::new(Node::new(NodeKind::Series, ptr::null())))
            .collect()
    }

    fn collect(set: &ReaderSet) -> Vec<ReaderPtr> {
        let seen = parking_lot::Mutex::new(Vec::new());
        set.for_all(|r| seen.lock().push(r));
        seen.into_inner()
    }

    #[test]
    fn test_empty_to_single_to_empty() {
        let readers = dummy_readers(1);
        let r = ReaderPtr(&*readers[0]);
        let set = ReaderSet::new();
        assert!(set.is_empty());
        set.insert(r);
        assert_eq!(collect(&set), vec![r]);
        set.remove(r);
        assert!(set.is_empty());
    }

    #[test]
    fn test_single_to_tree_to_single() {
        let readers = dummy_readers(2);
        let (a, b) = (ReaderPtr(&*readers[0]), ReaderPtr(&*readers[1]));
        let set = ReaderSet::new();
        set.insert(a);
        set.insert(b);
        let mut seen: Vec<usize> = collect(&set).iter().map(|r| r.0 as usize).collect();
        seen.sort_unstable();
        let mut expect = vec![a.0 as usize, b.0 as usize];
        expect.sort_unstable();
        assert_eq!(seen, expect);

        // Lazy removal reaps on the next traversal and collapses to single.
        set.remove(a);
        assert_eq!(collect(&set), vec![b]);
        assert_eq!(set.state.load(Ordering::Relaxed) & TAG, 0);
        set.remove(b);
        assert!(set.is_empty());
    }

    #[test]
    fn test_many_readers_then_drain() {
        let readers = dummy_readers(500);
        let set = ReaderSet::new();
        for r in &readers {
            set.insert(ReaderPtr(&**r));
        }
        assert_eq!(collect(&set).len(), 500);
        for r in readers.iter().take(499) {
            set.remove(ReaderPtr(&**r));
        }
        assert_eq!(collect(&set).len(), 1);
        set.remove(ReaderPtr(&*readers[499]));
        assert!(set.is_empty());
    }

    #[test]
    fn test_concurrent_inserts() {
        let readers = dummy_readers(1000);
        let ptrs: Vec<ReaderPtr> = readers.iter().map(|r| ReaderPtr(&**r)).collect();
        let set = ReaderSet::new();
        scheduler::parallel_for(0, ptrs.len(), 1, |i| set.insert(ptrs[i]));
        let count = AtomicUsize::new(0);
        set.for_all(|_| {
            count.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(count.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn test_rebuild_is_traversable_after_removals() {
        let readers = dummy_readers(64);
        let set = ReaderSet::new();
        for r in &readers {
            set.insert(ReaderPtr(&**r));
        }
        // Remove every other reader, traverse (rebuilds), then remove the
        // rest through the rebuilt tree.
        for r in readers.iter().step_by(2) {
            set.remove(ReaderPtr(&**r));
        }
        assert_eq!(collect(&set).len(), 32);
        for r in readers.iter().skip(1).step_by(2) {
            set.remove(ReaderPtr(&**r));
        }
        assert!(set.is_empty());
    }
}
