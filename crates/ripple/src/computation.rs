//! Computations: owning handles to recorded traces.

use std::ptr;

use crate::context::TraceContext;
use crate::node::{propagate_slot, Node, NodeKind, Slot};
use crate::scheduler;

/// Execute `f` as a fresh self-adjusting computation and return the handle
/// to its trace.
///
/// `f` runs on the worker pool; parallel primitives inside it fork there.
///
/// # Example
///
/// ```ignore
/// let input = Mod::with_value(5);
/// let output: Mod<i64> = Mod::new();
/// let (i, o) = (input.handle(), output.handle());
/// let mut comp = ripple::run(move |ctx| {
///     ctx.read(i, move |ctx, x| ctx.write(o, x + 1));
/// });
/// assert_eq!(output.value(), 6);
///
/// input.write(10);
/// comp.propagate();
/// assert_eq!(output.value(), 11);
/// ```
pub fn run<F>(f: F) -> Computation
where
    F: FnOnce(&mut TraceContext) + Send,
{
    scheduler::install(|| {
        let mut root: Slot = Some(Box::new(Node::new(NodeKind::Series, ptr::null())));
        {
            let mut ctx = TraceContext::at(&mut root);
            f(&mut ctx);
        }
        Computation { root }
    })
}

/// The owning handle to a recorded trace.
///
/// Dropping it destroys the trace (read nodes unsubscribe from their
/// dependencies), so it must be dropped before the modifiables it reads.
pub struct Computation {
    root: Slot,
}

// Safety: the trace is a tree of Send nodes owned exclusively by this
// handle.
unsafe impl Send for Computation {}

impl Computation {
    /// Push every pending update through the trace, re-executing exactly
    /// the read closures whose dependencies changed.
    ///
    /// Observes all writes made before the call; writes racing with the
    /// propagation may only take effect on the next one. Exclusive access
    /// makes concurrent propagations of one computation unrepresentable.
    pub fn propagate(&mut self) {
        scheduler::install(|| propagate_slot(&mut self.root));
    }

    /// Destroy the trace now, without waiting for drop.
    pub fn destroy(&mut self) {
        let root = self.root.take();
        scheduler::install(move || drop(root));
    }

    /// Number of nodes in the trace, for diagnostics.
    pub fn tree_size(&self) -> usize {
        self.root.as_deref().map_or(0, Node::count_nodes)
    }

    /// Bytes held by the trace's nodes and read closures, for diagnostics.
    pub fn memory(&self) -> usize {
        self.root.as_deref().map_or(0, Node::memory_bytes)
    }
}

impl Drop for Computation {
    fn drop(&mut self) {
        self.destroy();
    }
}
