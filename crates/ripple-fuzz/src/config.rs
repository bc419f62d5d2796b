//! Configuration for randomized workload runs.

/// Parameters of one fuzz run.
#[derive(Debug, Clone)]
pub struct FuzzConfig {
    /// Size of the tracked input array.
    pub elements: usize,

    /// Number of write-then-propagate rounds.
    pub update_rounds: u32,

    /// Writes applied per round (inclusive of deliberate no-op writes).
    pub writes_per_round: usize,

    /// Fraction of writes that rewrite the current value, which must not
    /// cause any re-execution.
    pub noop_write_ratio: f64,

    /// Granularity of the recorded parallel map.
    pub granularity: usize,

    /// Propagate a second time each round to check idempotence.
    pub double_propagate: bool,

    /// Seed for reproducibility.
    pub seed: u64,
}

impl FuzzConfig {
    /// A quick run, suitable as a unit test.
    pub fn small(seed: u64) -> Self {
        FuzzConfig {
            elements: 64,
            update_rounds: 20,
            writes_per_round: 4,
            noop_write_ratio: 0.25,
            granularity: 8,
            double_propagate: true,
            seed,
        }
    }

    /// A heavier run for manual shakeouts.
    pub fn large(seed: u64) -> Self {
        FuzzConfig {
            elements: 4096,
            update_rounds: 100,
            writes_per_round: 32,
            noop_write_ratio: 0.1,
            granularity: 64,
            double_propagate: false,
            seed,
        }
    }
}
