//! Drives a recorded map/reduce/select pipeline through random update
//! rounds and validates it against a plain sequential model every round.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ripple::{Computation, GarbageCollector, Mod, ModArray, ModRef, ModSlice, TraceContext};

use crate::config::FuzzConfig;

/// Outcome of a fuzz run. All counters are totals across rounds.
#[derive(Debug, Clone, Default)]
pub struct FuzzReport {
    pub rounds: u32,
    pub writes: usize,
    pub noop_writes: usize,
    /// Validation failures; zero on a healthy runtime.
    pub mismatches: u32,
    /// Read closures re-executed by propagation.
    pub reexecutions: usize,
}

/// The recorded pipeline: `mapped[i] = 3 * input[i] + 1`, summed by halves,
/// and a selector choosing which half's sum feeds the output. The selector
/// gives every round a chance to rebuild trace structure, not just refresh
/// leaf values.
struct Pipeline {
    result: Arc<Mod<i64>>,
    executions: Arc<AtomicUsize>,
}

fn map_step(
    ctx: &mut TraceContext,
    input: ModSlice<i64>,
    output: ModSlice<i64>,
    granularity: usize,
    executions: Arc<AtomicUsize>,
) {
    ctx.parallel_for(0, input.len(), granularity, move |ctx, i| {
        let (src, dst) = (input.get(i), output.get(i));
        let count = executions.clone();
        ctx.read(src, move |ctx, x| {
            count.fetch_add(1, Ordering::Relaxed);
            ctx.write(dst, 3 * x + 1);
        });
    });
}

fn sum_step(
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
            move |ctx| sum_step(ctx, lo, left_result, lc),
            move |ctx| sum_step(ctx, hi, right_result, rc),
        );
        let count = executions;
        ctx.read((left_result, right_result), move |ctx, (x, y)| {
            count.fetch_add(1, Ordering::Relaxed);
            ctx.write(result, x + y);
        });
    }
}

/// Sequential model of the same pipeline.
fn model_result(values: &[i64], selector: i64) -> i64 {
    let mapped: Vec<i64> = values.iter().map(|&x| 3 * x + 1).collect();
    let mid = mapped.len() / 2;
    if selector == 0 {
        mapped[..mid].iter().sum()
    } else {
        mapped[mid..].iter().sum()
    }
}

pub struct FuzzRunner {
    config: FuzzConfig,
    rng: StdRng,
}

impl FuzzRunner {
    pub fn new(config: FuzzConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        FuzzRunner { config, rng }
    }

    fn build(
        &self,
        input: &ModArray<i64>,
        mapped: &ModArray<i64>,
        selector: &Mod<i64>,
    ) -> (Computation, Pipeline) {
        let result = Arc::new(Mod::with_value(0i64));
        let executions = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline {
            result: result.clone(),
            executions: executions.clone(),
        };

        let (ins, maps, hsel, hres) = (
            input.slice(),
            mapped.slice(),
            selector.handle(),
            result.handle(),
        );
        let granularity = self.config.granularity;
        let comp = ripple::run(move |ctx| {
            map_step(ctx, ins, maps, granularity, executions.clone());
            let mid = maps.len() / 2;
            let left_sum = ctx.alloc::<i64>();
            let right_sum = ctx.alloc::<i64>();
            let (e1, e2) = (executions.clone(), executions.clone());
            sum_step(ctx, maps.range(0, mid), left_sum, e1);
            sum_step(ctx, maps.range(mid, maps.len()), right_sum, e2);
            let count = executions;
            ctx.read(hsel, move |ctx, which| {
                count.fetch_add(1, Ordering::Relaxed);
                let chosen = if which == 0 { left_sum } else { right_sum };
                ctx.read(chosen, move |ctx, total| ctx.write(hres, total));
            });
        });
        (comp, pipeline)
    }

    /// Run the configured number of rounds; every round must match the
    /// sequential model.
    pub fn run(&mut self) -> FuzzReport {
        let mut report = FuzzReport::default();
        let n = self.config.elements;

        let mut values: Vec<i64> = (0..n).map(|_| self.rng.gen_range(-100..100)).collect();
        let mut selector_value = 0i64;

        let input = ModArray::<i64>::new(n);
        for (i, &v) in values.iter().enumerate() {
            input[i].write(v);
        }
        let mapped = ModArray::<i64>::new(n);
        let selector = Mod::with_value(selector_value);

        let (mut comp, pipeline) = self.build(&input, &mapped, &selector);
        if pipeline.result.value() != model_result(&values, selector_value) {
            report.mismatches += 1;
        }

        for _ in 0..self.config.update_rounds {
            report.rounds += 1;

            for _ in 0..self.config.writes_per_round {
                let i = self.rng.gen_range(0..n);
                let noop = self.rng.gen_bool(self.config.noop_write_ratio);
                let v = if noop {
                    values[i]
                } else {
                    self.rng.gen_range(-100..100)
                };
                if noop {
                    report.noop_writes += 1;
                }
                values[i] = v;
                input[i].write(v);
                report.writes += 1;
            }
            if self.rng.gen_bool(0.3) {
                selector_value = 1 - selector_value;
                selector.write(selector_value);
            }

            let before = pipeline.executions.load(Ordering::Relaxed);
            comp.propagate();
            GarbageCollector::run();
            report.reexecutions += pipeline.executions.load(Ordering::Relaxed) - before;

            if pipeline.result.value() != model_result(&values, selector_value) {
                report.mismatches += 1;
            }

            if self.config.double_propagate {
                let stable = pipeline.executions.load(Ordering::Relaxed);
                comp.propagate();
                if pipeline.executions.load(Ordering::Relaxed) != stable {
                    report.mismatches += 1;
                }
            }
        }

        drop(comp);
        GarbageCollector::run();
        report
    }
}
