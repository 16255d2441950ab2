//! # vdm-metrics
//!
//! Run statistics for the vdmrt scheduler.
//!
//! Features:
//! - Histogram over virtual-time durations (message transit, activation gaps)
//! - Counters for scheduler events
//! - Gauges for current values
//! - Deterministic JSON snapshots

#![warn(missing_docs)]
#![warn(clippy::all)]

mod histogram;
mod collector;
mod export;

pub use histogram::Histogram;
pub use collector::Metrics;
pub use export::{HistogramSummary, MetricsSnapshot};

/// Macro for timing a block of code in wall-clock microseconds
#[macro_export]
macro_rules! timed {
    ($metrics:expr, $name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        $metrics.observe($name, start.elapsed().as_micros() as u64);
        result
    }};
}
