//! Background maintenance of index cardinality statistics.

pub mod catalog;
mod cardinality;
mod counters;
mod daemon;

pub use cardinality::{CardinalityScanner, CardinalityStats, ScanOutcome};
pub use counters::{IndexStatsCounters, RejectReason};
pub use daemon::IndexStatsDaemon;
