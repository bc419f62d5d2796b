//! Ripple: parallel self-adjusting computation.
//!
//! A self-adjusting program runs once while the runtime records its dynamic
//! execution as a Series-Parallel trace; afterwards, when inputs change,
//! [`Computation::propagate`] re-executes only the sub-computations whose
//! inputs actually changed, producing the same result as a full re-run in
//! time proportional to the change. Both the initial run and propagation
//! execute on a work-stealing fork-join pool.
//!
//! # Key pieces
//!
//! - **[`Mod<T>`] / [`ModArray<T>`]**: tracked cells. Writing a changed value
//!   marks every recorded reader pending; equal writes are free.
//! - **[`TraceContext`]**: the builder handle threaded through self-adjusting
//!   functions; `read`, `read_array`, `dynamic_scope`, `par`,
//!   `parallel_for`, `alloc`, `write`.
//! - **[`run`] / [`Computation`]**: execute a function under a fresh trace
//!   and propagate changes through it later.
//! - **[`GarbageCollector`]**: deferred reclamation of subtrees replaced
//!   during propagation; run it between rounds.
//! - **[`scheduler`]**: the fork-join pool (`par_do`, `parallel_for`,
//!   `set_num_workers`).
//!
//! # Example
//!
//! ```ignore
//! use ripple::{Mod, GarbageCollector};
//!
//! let a = Mod::with_value(1i64);
//! let b = Mod::with_value(2i64);
//! let sum: Mod<i64> = Mod::new();
//! let (ha, hb, hs) = (a.handle(), b.handle(), sum.handle());
//!
//! let mut comp = ripple::run(move |ctx| {
//!     ctx.read((ha, hb), move |ctx, (x, y)| ctx.write(hs, x + y));
//! });
//! assert_eq!(sum.value(), 3);
//!
//! a.write(10);
//! comp.propagate();
//! assert_eq!(sum.value(), 12);
//!
//! drop(comp);
//! GarbageCollector::run();
//! ```
//!
//! # Contracts
//!
//! This is a systems runtime, not a defensive library: contract violations
//! (reading a modifiable before its first write, destroying one with live
//! readers, letting a modifiable move while readers hold its address) are
//! debug assertions and undefined behavior in release builds. Writes to one
//! modifiable must not race with each other or with that modifiable's
//! reads; the structure of the computation normally provides this. User
//! closures that panic abort the computation — drop the handle.

mod alloc;
mod computation;
mod context;
mod gc;
mod modifiable;
mod node;
mod reader_set;
pub mod scheduler;

pub use computation::{run, Computation};
pub use context::{DynReads, ReadMods, TraceContext};
pub use gc::GarbageCollector;
pub use modifiable::{Mod, ModArray, ModRef, ModSlice, ModValue};
