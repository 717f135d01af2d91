//! Results returned to history consumers

use serde::{Deserialize, Serialize};

use super::snapshot::ThingSnapshot;

/// Outcome of one history read
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryResponse {
    /// Finalized items, oldest first
    pub history_items: Vec<ThingSnapshot>,
    /// Items seen but still waiting for their window to close
    pub pending_item_count: usize,
    /// Part of this consumer's range was compacted before it was read
    pub data_loss_detected: bool,
}

impl HistoryResponse {
    pub fn len(&self) -> usize {
        self.history_items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history_items.is_empty()
    }
}

/// Point-in-time counters about the historian
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistorianStats {
    /// Things with a stream
    pub thing_count: usize,
    /// Live consumer registrations
    pub consumer_count: usize,
    /// Items waiting in global ingestion buckets
    pub pending_bucket_items: usize,
    /// Records currently held across all streams
    pub stream_items: usize,
    /// Highest sequence number per thing
    pub last_sequence_numbers: Vec<(String, u64)>,
}
