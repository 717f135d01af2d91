//! Aggregation of property updates
//!
//! - `SnapshotManager`: time-bucketing of pending snapshots (used both for
//!   global ingestion and per-consumer re-aggregation)
//! - `stats`: running avg/min/max/count of numeric properties
//!
//! ```text
//! update ──► SnapshotManager (window S, cooldown C) ──► final bucket ──► callback
//!                 │  same window, mergeable: stats::merge_*
//!                 └─ same window, distinct capture: overflow list
//! ```

mod buckets;
pub mod stats;

pub use buckets::{BucketTable, PendingSnapshot, SequenceSpan, SnapshotManager};
pub use stats::PropertyStats;
