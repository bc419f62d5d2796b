//! Randomized equivalence testing for the ripple runtime.
//!
//! Builds a recorded map/reduce/select pipeline over a tracked array, then
//! applies seeded random write batches round after round, propagating and
//! validating against a plain sequential model each time. Checks, per
//! round:
//!
//! - the propagated output equals the model (propagate-after-writes is
//!   equivalent to rerunning from scratch);
//! - no-op writes cause no re-execution;
//! - a second propagation re-executes nothing (idempotence).
//!
//! ```ignore
//! use ripple_fuzz::{FuzzConfig, FuzzRunner};
//!
//! let report = FuzzRunner::new(FuzzConfig::small(42)).run();
//! assert_eq!(report.mismatches, 0);
//! ```

mod config;
mod runner;

pub use config::FuzzConfig;
pub use runner::{FuzzReport, FuzzRunner};
