//! Thing Historian
//!
//! A time-series historian for thing (device) property changes. Updates are
//! bucketed under the loosest policy any consumer needs, appended to a
//! per-thing sequence stream, and replayed to each consumer under its own
//! sampling window, property filter and retention settings.
//!
//! # Features
//!
//! - **Two-level aggregation**: global buckets at ingestion, private buckets per consumer
//! - **Full-state or delta delivery**: baselines are maintained across compaction
//! - **Running statistics**: `[Avg]`/`[Min]`/`[Max]`/`[N]` pseudo-properties
//! - **At-least-once cursors**: read, acknowledge, restart or rewind by timestamp
//! - **Retention**: idle tokens expire, streams compact up to the oldest cursor
//!
//! # Modules
//!
//! - `types`: Snapshots, registrations, responses
//! - `aggregation`: Bucket manager and statistics merging
//! - `store`: Sequence streams, registration table, materialized stores
//! - `historian`: Ingestion, retrieval, registration lifecycle, retention
//! - `config`: Historian configuration
//! - `error`: Error types
//! - `utils`: Time-window arithmetic, atomic JSONL files
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use thing_historian::{Historian, HistorianConfig, HistoryParameters};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let historian = Historian::new(HistorianConfig::default()).unwrap();
//!     let token = historian
//!         .register_consumer("pump-1", HistoryParameters::new(), None)
//!         .unwrap();
//!
//!     historian.add_property_snapshot("pump-1", "Temp", 21.5.into(), 1_000, 1);
//!
//!     let cancel = CancellationToken::new();
//!     let response = historian
//!         .get_history(token, None, 1, Some(Duration::from_secs(1)), &cancel, true)
//!         .await;
//!     println!("{:?}", response);
//! }
//! ```

pub mod aggregation;
pub mod config;
pub mod error;
pub mod historian;
pub mod store;
pub mod types;
pub mod utils;

// Re-export commonly used items at crate root
pub use config::HistorianConfig;
pub use error::{HistorianError, HistorianResult};
pub use historian::Historian;
pub use store::{MaterializedStore, MemoryMaterializedStore, MemorySequenceStream, SequenceStream};
pub use types::{
    AggregateFlags, ConsumerRegistration, ConsumerToken, Expiration, HistorianStats,
    HistoryParameters, HistoryResponse, PropertyMap, ThingSnapshot,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
