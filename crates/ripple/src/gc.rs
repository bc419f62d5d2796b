//! Deferred reclamation of detached trace subtrees.
//!
//! Re-execution detaches subtrees whose read nodes still sit in the reader
//! sets of modifiables owned elsewhere, and whose reader sets may still be
//! walked by concurrent writes. Destroying them immediately would race with
//! both, so they are parked on per-worker piles and destroyed in bulk
//! between propagation rounds, when the computation is quiescent. Bulk
//! destruction also lets large subtrees be torn down in parallel.

use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::node::Node;
use crate::scheduler;

type Pile = Mutex<Vec<Box<Node>>>;

/// Process-wide pool of per-worker piles of detached trace roots.
pub struct GarbageCollector {
    piles: Box<[Pile]>,
}

static INSTANCE: OnceLock<GarbageCollector> = OnceLock::new();

impl GarbageCollector {
    fn instance() -> &'static GarbageCollector {
        INSTANCE.get_or_init(|| {
            let slots = 2 * std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                + 1;
            GarbageCollector {
                piles: (0..slots).map(|_| Mutex::new(Vec::new())).collect(),
            }
        })
    }

    /// Park a detached subtree on the calling worker's pile.
    pub(crate) fn add(node: Box<Node>) {
        let gc = Self::instance();
        let pile = &gc.piles[scheduler::worker_id() % gc.piles.len()];
        pile.lock().push(node);
    }

    /// Destroy every parked subtree.
    ///
    /// Call between propagation rounds (or at least off the critical path),
    /// and before the modifiables that parked readers point at go away. The
    /// piles are drained on the worker pool so large subtrees are torn down
    /// in parallel.
    pub fn run() {
        let gc = Self::instance();
        scheduler::install(|| {
            for pile in gc.piles.iter() {
                let nodes = std::mem::take(&mut *pile.lock());
                drop(nodes);
            }
        });
    }

    /// Trace nodes currently awaiting destruction, across all piles.
    pub fn nodes() -> usize {
        let gc = Self::instance();
        gc.piles
            .iter()
            .map(|pile| {
                pile.lock()
                    .iter()
                    .map(|node| node.count_nodes())
                    .sum::<usize>()
            })
            .sum()
    }

    /// Bytes currently awaiting destruction, across all piles.
    pub fn memory() -> usize {
        let gc = Self::instance();
        gc.piles
            .iter()
            .map(|pile| {
                pile.lock()
                    .iter()
                    .map(|node| node.memory_bytes())
                    .sum::<usize>()
            })
            .sum()
    }
}
