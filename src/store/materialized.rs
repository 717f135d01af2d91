//! Dedicated per-consumer sinks

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{HistorianError, HistorianResult};
use crate::types::ThingSnapshot;

/// A store that receives every finalized history item of one consumer
///
/// Mapping snapshots onto the host's own record type is the implementor's
/// concern; the historian only appends and, on unregistration, removes.
pub trait MaterializedStore: Send + Sync {
    fn append_items(&self, items: &[ThingSnapshot]) -> HistorianResult<()>;

    /// Release the store once its consumer is gone
    fn remove_store(&self) -> HistorianResult<()>;
}

/// Vec-backed `MaterializedStore`
#[derive(Debug, Default)]
pub struct MemoryMaterializedStore {
    items: Mutex<Vec<ThingSnapshot>>,
    removed: AtomicBool,
}

impl MemoryMaterializedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<ThingSnapshot> {
        self.items.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

impl MaterializedStore for MemoryMaterializedStore {
    fn append_items(&self, items: &[ThingSnapshot]) -> HistorianResult<()> {
        if self.is_removed() {
            return Err(HistorianError::MaterializedStore(
                "store was removed".to_string(),
            ));
        }
        self.items.lock().extend_from_slice(items);
        Ok(())
    }

    fn remove_store(&self) -> HistorianResult<()> {
        self.removed.store(true, Ordering::Release);
        self.items.lock().clear();
        Ok(())
    }
}
