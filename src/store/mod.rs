//! Storage collaborators of the historian
//!
//! - `SequenceStream`: append-only, sequence-numbered log of snapshots per thing
//! - `MemorySequenceStream`: in-memory stream with optional JSONL persistence
//! - `RegistrationStore`: persisted table of durable consumer registrations
//! - `MaterializedStore`: dedicated per-consumer sink fed with finalized items
//!
//! # Stream layout
//!
//! ```text
//!  first_seq                                   last_seq
//!     │                                           │
//!     ▼                                           ▼
//! ┌───────┬───────┬───────┬───────┬───────┬───────┐
//! │ 3 (B) │ None  │ None  │ 6 (Δ) │ 7 (Δ) │ 8 (Δ) │   B = pinned full baseline
//! └───────┴───────┴───────┴───────┴───────┴───────┘   None = compacted tombstone
//! ```
//!
//! Compaction pops leading records and tombstones the rest, but the
//! designated baseline always survives so full state can be rebuilt from it.

mod materialized;
mod registrations;
mod stream;

use std::time::Duration;

use tokio::sync::watch;

use crate::error::HistorianResult;
use crate::types::{Expiration, ThingSnapshot};

pub use materialized::{MaterializedStore, MemoryMaterializedStore};
pub use registrations::RegistrationStore;
pub use stream::MemorySequenceStream;

/// Append-only ordered log of one thing's snapshots
///
/// Sequence numbers start at 1 and grow by one per append; 0 means
/// "before everything". Scans may return `None` tombstones where records
/// were compacted, and callers must treat them as data loss.
pub trait SequenceStream: Send + Sync {
    /// Append a record, assigning and returning its sequence number
    ///
    /// A pinned full record becomes the designated baseline.
    fn add_item(&self, item: ThingSnapshot) -> HistorianResult<u64>;

    /// Records from `from` forward, plus the sequence number of the first one
    ///
    /// The returned sequence number exceeds `from` when earlier records were
    /// compacted away.
    fn get_items(&self, from: u64) -> (Vec<Option<ThingSnapshot>>, u64);

    fn next_sequence_number(&self, sequence: u64) -> u64 {
        sequence.saturating_add(1)
    }

    fn previous_sequence_number(&self, sequence: u64) -> u64 {
        sequence.saturating_sub(1)
    }

    /// Oldest retained sequence number (0 when empty)
    fn first_sequence_number(&self) -> u64;

    /// Newest assigned sequence number (0 when nothing was ever appended)
    fn last_sequence_number(&self) -> u64;

    /// First sequence number whose timestamp is at or after `timestamp`
    ///
    /// Returns the next sequence number to be assigned when every record is older.
    fn offset_by_timestamp(&self, timestamp: i64) -> u64;

    /// Newest live record at or before `sequence` matching `predicate`
    fn find_last_item_at_or_before(
        &self,
        sequence: u64,
        predicate: &dyn Fn(&ThingSnapshot) -> bool,
    ) -> Option<ThingSnapshot>;

    /// Sequence number of the designated baseline (0 when there is none)
    fn baseline_sequence_number(&self) -> u64;

    /// Replace the record at `sequence` with `baseline` and make it the designated baseline
    fn set_baseline(&self, sequence: u64, baseline: ThingSnapshot) -> HistorianResult<()>;

    /// Change the retention marker of the baseline record at `sequence`
    fn pin_baseline(&self, sequence: u64, expiration: Expiration) -> HistorianResult<()>;

    /// Compact every record up to and including `sequence`, keeping the baseline
    ///
    /// Returns how many records were removed.
    fn delete_items_up_to(&self, sequence: u64) -> usize;

    /// Make the next append get a sequence number above `sequence`
    ///
    /// Numbers skipped this way read back as tombstones. Returns false when
    /// the stream was already past `sequence`.
    fn skip_past(&self, sequence: u64) -> bool;

    /// Size and age limits applied on append (`None` = unbounded)
    fn set_retention(&self, max_items: Option<usize>, max_age: Option<Duration>);

    /// Signal carrying the last appended sequence number
    fn subscribe(&self) -> watch::Receiver<u64>;

    /// Live (non-tombstoned) records
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the stream (no-op for memory-only streams)
    fn save(&self) -> HistorianResult<()>;

    /// Drop every record and the persisted copy
    fn remove(&self) -> HistorianResult<()>;
}
