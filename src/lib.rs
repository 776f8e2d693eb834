//! Flow meters for measuring per-stream rates and totals.
//!
//! A [Meter] tracks a monotonically increasing counter and reports both the
//! running total and a smoothed rate over a one second window. Meters are
//! cheap: producers pay a single atomic add per [Meter::mark], while one
//! process-wide background sweeper recomputes all rates once per second.
//! Meters whose rate decays below [IDLE_RATE] stop being tracked entirely and
//! resume seamlessly on their next mark, so a peer-to-peer stack can keep a
//! meter per connection, stream or protocol without paying for the quiet ones.
//!
//! [MeterRegistry] adds a named map on top of the meters, including pruning of
//! meters which have gone quiet. The sweep cadence is driven by a pluggable
//! [Clock]; tests install a [ManualClock] through [set_clock] to make time
//! fully deterministic.

pub use clock::*;
pub use meter::*;
pub use registry::*;
pub use sweeper::{restore_clock, set_clock, IDLE_RATE};

mod clock;
mod meter;
mod registry;
mod sweeper;
