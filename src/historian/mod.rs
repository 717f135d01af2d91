//! Historian - capture, compaction and replay of thing property history
//!
//! # Architecture
//!
//! ```text
//! Ingestion:
//! ┌──────────────┐    ┌──────────────────┐  final   ┌────────────────┐
//! │ property set │───►│ global buckets   │─────────►│ SequenceStream │
//! │ (thing, path)│    │ (combined policy)│  timer   │ (per thing)    │
//! └──────────────┘    └──────────────────┘          └───────┬────────┘
//!                                                           │ scan from cursor
//! Retrieval (per consumer):                                 ▼
//! ┌──────────────┐    ┌──────────────────┐  final   ┌────────────────┐
//! │ HistoryResp. │◄───│ consumer buckets │◄─────────│ filter/rebuild │
//! └──────────────┘    │ (own policy)     │          └────────────────┘
//!                     └──────────────────┘
//!
//! Retention: expire idle tokens ─► rebuild baseline ─► compact up to the oldest cursor
//! ```

mod combined;
mod ingest;
mod propagation;
mod registration;
mod retention;
mod retrieval;
mod scheduler;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregation::SnapshotManager;
use crate::config::HistorianConfig;
use crate::error::HistorianResult;
use crate::store::{MaterializedStore, MemorySequenceStream, RegistrationStore, SequenceStream};
use crate::types::{
    ConsumerRegistration, ConsumerToken, HistorianStats, HistoryParameters, HistoryResponse,
    PropertyMap,
};
use crate::utils::atomic::cleanup_temp_files;
use crate::utils::time::now_millis;

pub use combined::CombinedRegistration;
pub use ingest::is_meta_property;
pub use scheduler::{FlushScheduler, TimerTick};

use propagation::UpdatePump;
use retrieval::ReadState;

/// Everything the historian keeps for one thing
pub(crate) struct ThingLog {
    pub(crate) thing_id: String,
    pub(crate) stream: Arc<dyn SequenceStream>,
    /// First-level buckets under the combined policy
    pub(crate) global: SnapshotManager,
    pub(crate) combined: RwLock<Option<CombinedRegistration>>,
    /// Latest value of every property ever reported
    pub(crate) current_state: Mutex<PropertyMap>,
    /// A baseline sentinel sits in a global bucket, not yet in the stream
    pub(crate) baseline_pending: AtomicBool,
    pub(crate) scheduler: FlushScheduler,
}

impl ThingLog {
    pub(crate) fn combined(&self) -> Option<CombinedRegistration> {
        self.combined.read().clone()
    }
}

/// A live consumer registration plus its read-side state
pub(crate) struct Consumer {
    pub(crate) token: ConsumerToken,
    pub(crate) thing_id: String,
    pub(crate) registration: Mutex<ConsumerRegistration>,
    /// Serializes reads of one token
    pub(crate) read_state: tokio::sync::Mutex<ReadState>,
    pub(crate) store: Mutex<Option<Arc<dyn MaterializedStore>>>,
    pub(crate) pump: UpdatePump,
}

impl Consumer {
    fn new(registration: ConsumerRegistration, store: Option<Arc<dyn MaterializedStore>>) -> Self {
        Self {
            token: registration.token,
            thing_id: registration.thing_id.clone(),
            read_state: tokio::sync::Mutex::new(ReadState::new(&registration)),
            registration: Mutex::new(registration),
            store: Mutex::new(store),
            pump: UpdatePump::default(),
        }
    }

    pub(crate) fn parameters(&self) -> HistoryParameters {
        self.registration.lock().parameters.clone()
    }

    pub(crate) fn store(&self) -> Option<Arc<dyn MaterializedStore>> {
        self.store.lock().clone()
    }
}

/// The thing property historian
///
/// Create one per process with [`Historian::new`]; it is shared as an `Arc`.
pub struct Historian {
    pub(crate) config: HistorianConfig,
    pub(crate) things: RwLock<HashMap<String, Arc<ThingLog>>>,
    creation_lock: Mutex<()>,
    pub(crate) consumers: RwLock<HashMap<ConsumerToken, Arc<Consumer>>>,
    pub(crate) registrations: RegistrationStore,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) shutdown_token: CancellationToken,
    pub(crate) last_cleanup: Mutex<Instant>,
    pub(crate) runtime: Option<Handle>,
    self_ref: Weak<Historian>,
}

impl Historian {
    /// Create a historian, restoring persisted consumers and streams
    ///
    /// Call from inside a tokio runtime to get background flushing; without
    /// one, final buckets only drain when history is read.
    pub fn new(config: HistorianConfig) -> HistorianResult<Arc<Self>> {
        if let Some(dir) = &config.data_dir {
            cleanup_temp_files(dir)?;
        }
        if let Some(dir) = config.streams_dir() {
            cleanup_temp_files(dir)?;
        }

        let registrations = RegistrationStore::open(config.registrations_path())?;
        let runtime = Handle::try_current().ok();
        if runtime.is_none() {
            warn!("No tokio runtime; flush timers are disabled");
        }

        let historian = Arc::new_cyclic(|self_ref| Historian {
            config,
            things: RwLock::new(HashMap::new()),
            creation_lock: Mutex::new(()),
            consumers: RwLock::new(HashMap::new()),
            registrations,
            shutting_down: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            last_cleanup: Mutex::new(Instant::now()),
            runtime,
            self_ref: self_ref.clone(),
        });

        let restored = registration::restore_consumers(&historian)?;
        info!(
            data_dir = ?historian.config.data_dir,
            restored,
            "Historian started"
        );
        Ok(historian)
    }

    pub fn config(&self) -> &HistorianConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Get or create the log of `thing_id`
    pub(crate) fn thing(&self, thing_id: &str) -> HistorianResult<Arc<ThingLog>> {
        if let Some(thing) = self.things.read().get(thing_id) {
            return Ok(thing.clone());
        }

        let _guard = self.creation_lock.lock();
        if let Some(thing) = self.things.read().get(thing_id) {
            return Ok(thing.clone());
        }

        let stream = MemorySequenceStream::open(thing_id, self.config.stream_path(thing_id))?;
        let current_state = ingest::restore_state(&stream);

        let weak = self.self_ref.clone();
        let id = thing_id.to_string();
        let tick: TimerTick =
            Arc::new(move || weak.upgrade().and_then(|h| ingest::on_snapshot_timer(&h, &id)));

        let thing = Arc::new(ThingLog {
            thing_id: thing_id.to_string(),
            stream: Arc::new(stream),
            global: SnapshotManager::new(0, 0, 0),
            combined: RwLock::new(None),
            current_state: Mutex::new(current_state),
            baseline_pending: AtomicBool::new(false),
            scheduler: FlushScheduler::new(
                self.runtime.clone(),
                tick,
                self.config.min_timer_wait,
            ),
        });

        self.things
            .write()
            .insert(thing_id.to_string(), thing.clone());
        Ok(thing)
    }

    pub(crate) fn existing_thing(&self, thing_id: &str) -> Option<Arc<ThingLog>> {
        self.things.read().get(thing_id).cloned()
    }

    /// Live consumer for `token`; expired tokens are unregistered on sight
    pub(crate) fn consumer(&self, token: &ConsumerToken) -> Option<Arc<Consumer>> {
        let consumer = self.consumers.read().get(token).cloned()?;
        let expired = consumer
            .registration
            .lock()
            .is_expired(now_millis(), self.config.default_token_expiration);
        if expired {
            info!(token = %token, thing = %consumer.thing_id, "Consumer token expired");
            self.unregister_consumer(*token);
            return None;
        }
        Some(consumer)
    }

    pub(crate) fn consumers_of(&self, thing_id: &str) -> Vec<Arc<Consumer>> {
        self.consumers
            .read()
            .values()
            .filter(|c| c.thing_id == thing_id)
            .cloned()
            .collect()
    }

    /// Recompute the union policy of `thing` and re-window its global buckets
    pub(crate) fn recompute_combined(&self, thing: &ThingLog) {
        let parameters: Vec<HistoryParameters> = self
            .consumers_of(&thing.thing_id)
            .iter()
            .map(|c| c.parameters())
            .collect();
        let combined = CombinedRegistration::from_parameters(&parameters);

        let mut slot = thing.combined.write();
        if *slot == combined {
            return;
        }
        match &combined {
            Some(c) => {
                thing
                    .global
                    .update_intervals(c.sample_window, c.cooldown, c.sample_window);
                thing.stream.set_retention(c.max_count, c.max_age);
            }
            None => thing.stream.set_retention(None, None),
        }
        debug!(thing = %thing.thing_id, ?combined, "Combined registration changed");
        *slot = combined;
    }

    /// Latest known value of every property of `thing_id`
    pub fn current_state(&self, thing_id: &str) -> Option<PropertyMap> {
        self.existing_thing(thing_id)
            .map(|thing| thing.current_state.lock().clone())
    }

    /// Point-in-time counters
    pub fn stats(&self) -> HistorianStats {
        let things: Vec<Arc<ThingLog>> = self.things.read().values().cloned().collect();
        let mut last_sequence_numbers: Vec<(String, u64)> = things
            .iter()
            .map(|t| (t.thing_id.clone(), t.stream.last_sequence_number()))
            .collect();
        last_sequence_numbers.sort();

        HistorianStats {
            thing_count: things.len(),
            consumer_count: self.consumers.read().len(),
            pending_bucket_items: things.iter().map(|t| t.global.pending_count()).sum(),
            stream_items: things.iter().map(|t| t.stream.len()).sum(),
            last_sequence_numbers,
        }
    }

    /// Flush everything, stop timers and save all state
    ///
    /// In-flight reads keep running but poll at the shutdown cadence.
    pub fn shutdown(&self) -> HistorianResult<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Historian shutting down");

        let things: Vec<Arc<ThingLog>> = self.things.read().values().cloned().collect();
        for thing in &things {
            thing.scheduler.disarm();
            ingest::flush_all(thing);
            thing.stream.save()?;
        }
        self.registrations.save()?;
        self.shutdown_token.cancel();
        Ok(())
    }
}

// Public API, implemented in the submodules
impl Historian {
    // Ingestion (ingest.rs)
    pub fn add_property_snapshot(
        &self,
        thing_id: &str,
        property_path: &str,
        value: Value,
        timestamp: i64,
        sequence: u64,
    ) {
        ingest::add_property_snapshot(self, thing_id, property_path, value, timestamp, sequence)
    }

    // Registration (registration.rs)
    pub fn register_consumer(
        &self,
        thing_id: &str,
        parameters: HistoryParameters,
        store: Option<Arc<dyn MaterializedStore>>,
    ) -> HistorianResult<ConsumerToken> {
        registration::register_consumer(self, thing_id, parameters, store)
    }

    pub fn unregister_consumer(&self, token: ConsumerToken) -> bool {
        registration::unregister_consumer(self, token)
    }

    pub fn unregister_all_consumers_for_owner(&self, thing_id: &str) -> bool {
        registration::unregister_all_consumers_for_owner(self, thing_id)
    }

    pub fn get_history_parameters(&self, token: ConsumerToken) -> Option<HistoryParameters> {
        registration::get_history_parameters(self, token)
    }

    pub fn restart_history(
        &self,
        token: ConsumerToken,
        parameters: HistoryParameters,
        store: Option<Arc<dyn MaterializedStore>>,
    ) -> bool {
        registration::restart_history(self, token, parameters, store)
    }

    pub fn clear_history(&self, token: ConsumerToken) -> bool {
        registration::clear_history(self, token)
    }

    pub fn set_history_cursor(&self, token: ConsumerToken, timestamp: i64) -> bool {
        registration::set_history_cursor(self, token, timestamp)
    }

    // Retrieval (retrieval.rs)

    /// Read finalized history for `token`
    ///
    /// Waits until at least `min_count` items are available, `timeout`
    /// (capped at `max_wait`) elapses or `cancel` fires. Returns `None` for
    /// unknown or expired tokens and on internal errors.
    pub async fn get_history(
        &self,
        token: ConsumerToken,
        max_count: Option<usize>,
        min_count: usize,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        clear_history: bool,
    ) -> Option<HistoryResponse> {
        retrieval::get_history(self, token, max_count, min_count, timeout, cancel, clear_history)
            .await
    }

    // Retention (retention.rs)
    pub fn clear_unused_history(&self) -> bool {
        retention::clear_unused_history(self)
    }

    pub fn delete_thing_history(&self, thing_id: &str) -> bool {
        retention::delete_thing_history(self, thing_id)
    }
}
