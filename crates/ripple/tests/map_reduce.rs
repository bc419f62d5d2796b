//! Map + reduce pipeline over a modifiable array, with incremental updates.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ripple::{GarbageCollector, Mod, ModArray, ModRef, ModSlice, TraceContext};

static GC_LOCK: Mutex<()> = Mutex::new(());

fn gc_guard() -> MutexGuard<'static, ()> {
    GC_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// `output[i] = f(input[i])`, one read node per element.
fn map(
    ctx: &mut TraceContext,
    input: ModSlice<i64>,
    output: ModSlice<i64>,
    f: fn(i64) -> i64,
    executions: Arc<AtomicUsize>,
) {
    ctx.parallel_for(0, input.len(), 64, move |ctx, i| {
        let (src, dst) = (input.get(i), output.get(i));
        let count = executions.clone();
        ctx.read(src, move |ctx, x| {
            count.fetch_add(1, Ordering::Relaxed);
            ctx.write(dst, f(x));
        });
    });
}

/// Balanced divide-and-conquer sum into `result`.
fn sum(
    ctx: &mut TraceContext,
    input: ModSlice<i64>,
    result: ModRef<i64>,
    executions: Arc<AtomicUsize>,
) {
    if input.len() == 1 {
        let m = input.get(0);
        let count = executions;
        ctx.read(m, move |ctx, x| {
            count.fetch_add(1, Ordering::Relaxed);
            ctx.write(result, x);
        });
    } else {
        let mid = input.len() / 2;
        let left_result = ctx.alloc::<i64>();
        let right_result = ctx.alloc::<i64>();
        let (lo, hi) = (input.range(0, mid), input.range(mid, input.len()));
        let (lc, rc) = (executions.clone(), executions.clone());
        ctx.par(
            move |ctx| sum(ctx, lo, left_result, lc),
            move |ctx| sum(ctx, hi, right_result, rc),
        );
        let count = executions;
        ctx.read((left_result, right_result), move |ctx, (x, y)| {
            count.fetch_add(1, Ordering::Relaxed);
            ctx.write(result, x + y);
        });
    }
}

#[test]
fn test_map_sum_incremental() {
    let _guard = gc_guard();
    let n = 1000;
    let a = ModArray::<i64>::new(n);
    for i in 0..n {
        a[i].write(i as i64);
    }
    let b = ModArray::<i64>::new(n);
    let result = Mod::with_value(0i64);

    let executions = Arc::new(AtomicUsize::new(0));
    let (ia, ib, hr) = (a.slice(), b.slice(), result.handle());
    let (map_execs, sum_execs) = (executions.clone(), executions.clone());
    let mut comp = ripple::run(move |ctx| {
        map(ctx, ia, ib, |x| 2 * x, map_execs);
        sum(ctx, ib, hr, sum_execs);
    });

    // 2 * (0 + 1 + ... + 999)
    assert_eq!(result.value(), 999_000);
    let initial_executions = executions.load(Ordering::Relaxed);
    // One map read per element, one sum read per node of the reduction tree.
    assert_eq!(initial_executions, n + (2 * n - 1));

    a[500].write(1000);
    comp.propagate();
    assert_eq!(result.value(), 1_000_000);

    // Only the touched map read and the path up the reduction tree re-ran:
    // a vanishing fraction of the trace.
    let reexecutions = executions.load(Ordering::Relaxed) - initial_executions;
    assert!(reexecutions > 0);
    assert!(
        reexecutions <= 16,
        "expected a root-to-leaf path, re-executed {reexecutions} reads"
    );

    drop(comp);
    GarbageCollector::run();
}

#[test]
fn test_map_sum_matches_rerun_after_many_writes() {
    let _guard = gc_guard();
    let n = 256;
    let a = ModArray::<i64>::new(n);
    for i in 0..n {
        a[i].write(i as i64);
    }
    let b = ModArray::<i64>::new(n);
    let result = Mod::with_value(0i64);
    let executions = Arc::new(AtomicUsize::new(0));

    let (ia, ib, hr) = (a.slice(), b.slice(), result.handle());
    let (me, se) = (executions.clone(), executions.clone());
    let mut comp = ripple::run(move |ctx| {
        map(ctx, ia, ib, |x| 3 * x + 1, me);
        sum(ctx, ib, hr, se);
    });

    // Scattered updates, then one propagation.
    let writes = [(0usize, -5i64), (17, 1000), (128, 0), (255, 7), (17, -1)];
    for &(i, v) in &writes {
        a[i].write(v);
    }
    comp.propagate();

    let expected: i64 = (0..n as i64)
        .map(|i| match i {
            0 => -5,
            17 => -1,
            128 => 0,
            255 => 7,
            _ => i,
        })
        .map(|x| 3 * x + 1)
        .sum();
    assert_eq!(result.value(), expected);

    drop(comp);
    GarbageCollector::run();
}
