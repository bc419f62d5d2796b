//! Builder primitives: run, read variants, alloc, par, parallel_for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ripple::{GarbageCollector, Mod, ModArray, TraceContext};

// The reclamation piles are process-wide; hold this while a test propagates
// or collects so concurrently running tests cannot reclaim its subtrees.
static GC_LOCK: Mutex<()> = Mutex::new(());

fn gc_guard() -> MutexGuard<'static, ()> {
    GC_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn test_run_produces_nonempty_trace() {
    let comp = ripple::run(|_ctx| {});
    assert_eq!(comp.tree_size(), 1);
}

#[test]
fn test_function_call_inlines() {
    fn callee(_ctx: &mut TraceContext, called: &Arc<AtomicBool>) {
        called.store(true, Ordering::Relaxed);
    }

    fn caller(ctx: &mut TraceContext, called: &Arc<AtomicBool>) {
        callee(ctx, called);
    }

    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    let _comp = ripple::run(move |ctx| caller(ctx, &flag));
    assert!(called.load(Ordering::Relaxed));
}

#[test]
fn test_read_sees_written_value() {
    let m = Mod::with_value(5i64);
    let seen = Mod::with_value(0i64);
    let (hm, hs) = (m.handle(), seen.handle());
    let _comp = ripple::run(move |ctx| {
        ctx.read(hm, move |ctx, x| ctx.write(hs, x));
    });
    assert_eq!(seen.value(), 5);
}

#[test]
fn test_tuple_read() {
    let a = Mod::with_value(1i64);
    let b = Mod::with_value(2i32);
    let out = Mod::with_value(0i64);
    let (ha, hb, ho) = (a.handle(), b.handle(), out.handle());
    let _comp = ripple::run(move |ctx| {
        ctx.read((ha, hb), move |ctx, (x, y)| ctx.write(ho, x + y as i64));
    });
    assert_eq!(out.value(), 3);
}

#[test]
fn test_array_read() {
    let mods = ModArray::<i64>::new(10);
    for i in 0..10 {
        mods[i].write(i as i64);
    }
    let sum = Mod::with_value(0i64);
    let (slice, hs) = (mods.slice(), sum.handle());
    let _comp = ripple::run(move |ctx| {
        ctx.read_array(slice, move |ctx, values| {
            ctx.write(hs, values.iter().sum());
        });
    });
    assert_eq!(sum.value(), 45);
}

#[test]
fn test_dynamic_read() {
    let mods = ModArray::<i64>::new(10);
    for i in 0..10 {
        mods[i].write(i as i64);
    }
    let sum = Mod::with_value(0i64);
    let (slice, hs) = (mods.slice(), sum.handle());
    let _comp = ripple::run(move |ctx| {
        ctx.dynamic_scope(move |ctx, reads| {
            let mut total = 0;
            for i in 0..slice.len() {
                total += reads.read(slice.get(i));
            }
            ctx.write(hs, total);
        });
    });
    assert_eq!(sum.value(), 45);
}

#[test]
fn test_alloc_inside_trace() {
    let success = Mod::with_value(false);
    let hs = success.handle();
    let _comp = ripple::run(move |ctx| {
        let m = ctx.alloc::<i64>();
        ctx.write(m, 5);
        ctx.read(m, move |ctx, x| ctx.write(hs, x == 5));
    });
    assert!(success.value());
}

#[test]
fn test_alloc_nontrivial_value() {
    let success = Mod::with_value(false);
    let hs = success.handle();
    let _comp = ripple::run(move |ctx| {
        let m = ctx.alloc::<String>();
        ctx.write(m, String::from("Hello, friends"));
        ctx.read(m, move |ctx, s| ctx.write(hs, s == "Hello, friends"));
    });
    assert!(success.value());
}

#[test]
fn test_alloc_array() {
    let success = Mod::with_value(false);
    let hs = success.handle();
    let _comp = ripple::run(move |ctx| {
        let mods = ctx.alloc_array::<i64>(10);
        for i in 0..10 {
            ctx.write(mods.get(i), i as i64);
        }
        ctx.read_array(mods, move |ctx, values| {
            let good = values.iter().enumerate().all(|(i, &v)| v == i as i64);
            ctx.write(hs, good);
        });
    });
    assert!(success.value());
}

#[test]
fn test_alloc_inside_read() {
    let _guard = gc_guard();
    let m = Mod::with_value(5i64);
    let out = Mod::with_value(0i64);
    let (hm, ho) = (m.handle(), out.handle());
    let mut comp = ripple::run(move |ctx| {
        ctx.read(hm, move |ctx, x| {
            let tmp = ctx.alloc::<i64>();
            ctx.write(tmp, x + 1);
            ctx.read(tmp, move |ctx, y| ctx.write(ho, y));
        });
    });
    assert_eq!(out.value(), 6);

    // The allocation is owned by the read node and replaced wholesale on
    // re-execution.
    m.write(10);
    comp.propagate();
    assert_eq!(out.value(), 11);
    drop(comp);
    GarbageCollector::run();
}

#[test]
fn test_write_through_mod_array() {
    let a = ModArray::<i64>::new(10);
    let slice = a.slice();
    let _comp = ripple::run(move |ctx| {
        for i in 0..slice.len() {
            ctx.write(slice.get(i), i as i64);
        }
    });
    for i in 0..10 {
        assert_eq!(a[i].value(), i as i64);
    }
}

#[test]
fn test_par_runs_both_branches() {
    let a = Mod::with_value(0i64);
    let b = Mod::with_value(0i64);
    let (ha, hb) = (a.handle(), b.handle());
    let _comp = ripple::run(move |ctx| {
        ctx.par(
            move |ctx| ctx.write(ha, 1),
            move |ctx| ctx.write(hb, 2),
        );
    });
    assert_eq!(a.value(), 1);
    assert_eq!(b.value(), 2);
}

#[test]
fn test_nested_par() {
    let mods = ModArray::<i64>::new(4);
    let s = mods.slice();
    let _comp = ripple::run(move |ctx| {
        ctx.par(
            move |ctx| {
                ctx.par(
                    move |ctx| ctx.write(s.get(0), 1),
                    move |ctx| ctx.write(s.get(1), 2),
                );
            },
            move |ctx| {
                ctx.par(
                    move |ctx| ctx.write(s.get(2), 3),
                    move |ctx| ctx.write(s.get(3), 4),
                );
            },
        );
    });
    for i in 0..4 {
        assert_eq!(mods[i].value(), i as i64 + 1);
    }
}

#[test]
fn test_parallel_for_writes_every_index() {
    let mods = ModArray::<i64>::new(100);
    let s = mods.slice();
    let _comp = ripple::run(move |ctx| {
        ctx.parallel_for(0, 100, 1, move |ctx, i| {
            ctx.write(s.get(i), i as i64);
        });
    });
    for i in 0..100 {
        assert_eq!(mods[i].value(), i as i64);
    }
}

#[test]
fn test_empty_parallel_for_records_nothing() {
    let comp = ripple::run(|ctx| {
        ctx.parallel_for(7, 7, 1, |_ctx, _i| {
            panic!("body must not run for an empty range");
        });
    });
    // Only the root series node.
    assert_eq!(comp.tree_size(), 1);
}

#[test]
fn test_par_with_idle_branch_keeps_shape() {
    let m = Mod::with_value(0i64);
    let hm = m.handle();
    let comp = ripple::run(move |ctx| {
        ctx.par(|_ctx| {}, move |ctx| ctx.write(hm, 1));
    });
    // Root series, the parallel node, and its two series children; the idle
    // branch still gets its (empty) series child.
    assert_eq!(comp.tree_size(), 4);
    assert_eq!(m.value(), 1);
}

#[test]
fn test_trace_memory_is_positive() {
    let m = Mod::with_value(1i64);
    let hm = m.handle();
    let comp = ripple::run(move |ctx| {
        ctx.read(hm, |_ctx, _x| {});
    });
    assert!(comp.memory() > 0);
    assert!(comp.tree_size() >= 2);
}
