//! Work-stealing fork-join scheduler.
//!
//! Every source of parallelism in the runtime flows through this module: the
//! builder forks here while recording parallel trace nodes, the propagator
//! forks here while re-executing them, and the garbage collector tears down
//! detached subtrees here. The pool is process-wide and lazily initialized;
//! its size comes from the `RIPPLE_WORKERS` environment variable when set,
//! otherwise from the available parallelism of the machine.

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use rayon::ThreadPool;

struct PoolSlot {
    pool: RwLock<Arc<ThreadPool>>,
}

static POOL: OnceLock<PoolSlot> = OnceLock::new();

fn build_pool(num_threads: usize) -> Arc<ThreadPool> {
    Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("ripple-worker-{i}"))
            .build()
            .expect("failed to build worker pool"),
    )
}

fn default_workers() -> usize {
    if let Ok(v) = std::env::var("RIPPLE_WORKERS") {
        if let Ok(n) = v.parse::<usize>() {
            if n > 0 {
                return n;
            }
        }
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn slot() -> &'static PoolSlot {
    POOL.get_or_init(|| PoolSlot {
        pool: RwLock::new(build_pool(default_workers())),
    })
}

fn pool() -> Arc<ThreadPool> {
    slot().pool.read().clone()
}

/// Number of worker threads in the pool.
pub fn num_workers() -> usize {
    pool().current_num_threads()
}

/// Resize the worker pool to `num_threads` threads.
///
/// This is a cold operation: a fresh pool is swapped in and the old one
/// quiesces once its in-flight work completes. Do not call it while a
/// computation is running or propagating.
pub fn set_num_workers(num_threads: usize) {
    assert!(num_threads > 0, "worker pool must have at least one thread");
    *slot().pool.write() = build_pool(num_threads);
}

/// Identifier of the calling worker, in `0..=num_workers()`.
///
/// Pool workers get their thread index; threads outside the pool (for
/// example the thread that called [`crate::run`] before the pool picked the
/// work up) all share the extra identifier `num_workers()`.
pub fn worker_id() -> usize {
    rayon::current_thread_index().unwrap_or_else(num_workers)
}

/// Run `f` on the pool so nested forks are serviced by the workers.
///
/// Calls from inside the pool run `f` inline.
pub(crate) fn install<R, F>(f: F) -> R
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    if rayon::current_thread_index().is_some() {
        f()
    } else {
        pool().install(f)
    }
}

/// Run `left` and `right` as if in parallel; returns once both complete.
///
/// One closure runs inline on the calling worker while the other is exposed
/// for stealing; if no steal happens both run inline. Effects of both
/// closures are visible to the caller afterwards (acquire/release at the
/// join).
pub fn par_do<A, B, RA, RB>(left: A, right: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    if rayon::current_thread_index().is_some() {
        rayon::join(left, right)
    } else {
        pool().join(left, right)
    }
}

/// Apply `f` to every index in `[lo, hi)`, forking recursively down to
/// `granularity` indices per task (0 picks a granularity from the range
/// size and worker count).
pub fn parallel_for<F>(lo: usize, hi: usize, granularity: usize, f: F)
where
    F: Fn(usize) + Sync,
{
    if lo >= hi {
        return;
    }
    let granularity = if granularity == 0 {
        ((hi - lo) / (8 * num_workers().max(1))).max(1)
    } else {
        granularity
    };
    install(|| parallel_for_rec(lo, hi, granularity, &f));
}

fn parallel_for_rec<F>(lo: usize, hi: usize, granularity: usize, f: &F)
where
    F: Fn(usize) + Sync,
{
    if hi - lo <= granularity {
        for i in lo..hi {
            f(i);
        }
    } else {
        let mid = lo + (hi - lo) / 2;
        rayon::join(
            || parallel_for_rec(lo, mid, granularity, f),
            || parallel_for_rec(mid, hi, granularity, f),
        );
    }
}
