//! Snapshot Manager: time-bucketed aggregation of pending snapshots
//!
//! Updates are grouped into buckets keyed by the start of their sampling
//! window. A bucket is final once its expiration has passed; draining final
//! buckets is the only way items leave the manager, so nothing is ever
//! dropped here, and a policy change re-windows pending items instead of
//! discarding them.
//!
//! Two captures that land in the same window but can't be merged (for
//! example two alarms with the same timestamp) are kept apart in the
//! bucket's overflow list and released one after the other.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use parking_lot::{Mutex, MutexGuard};

use crate::types::ThingSnapshot;
use crate::utils::time::{now_millis, window_end, window_start};

/// Lowest and highest sequence numbers folded into one capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceSpan {
    pub first: u64,
    pub last: u64,
}

impl SequenceSpan {
    pub fn single(sequence: u64) -> Self {
        Self {
            first: sequence,
            last: sequence,
        }
    }

    fn include(&mut self, sequence: u64) {
        self.first = self.first.min(sequence);
        self.last = self.last.max(sequence);
    }
}

#[derive(Debug, Clone)]
struct PendingItem {
    id: u64,
    snapshot: ThingSnapshot,
    span: SequenceSpan,
}

/// An open bucket: primary capture, overflow captures and release time
#[derive(Debug)]
pub struct PendingSnapshot {
    primary: PendingItem,
    overflow: Vec<PendingItem>,
    /// Unix milliseconds at which the bucket becomes final
    pub expiration: i64,
    /// Highest sequence number folded into this bucket
    pub max_sequence_number: u64,
}

impl PendingSnapshot {
    /// The primary capture
    pub fn snapshot(&self) -> &ThingSnapshot {
        &self.primary.snapshot
    }

    /// The capture new values merge into: the newest overflow item, else the primary
    pub fn mergeable(&self) -> &ThingSnapshot {
        self.overflow
            .last()
            .map(|item| &item.snapshot)
            .unwrap_or(&self.primary.snapshot)
    }

    /// Mutable access to [`mergeable`](Self::mergeable)
    pub fn mergeable_mut(&mut self) -> &mut ThingSnapshot {
        match self.overflow.last_mut() {
            Some(item) => &mut item.snapshot,
            None => &mut self.primary.snapshot,
        }
    }

    /// Record that `sequence` was folded into the mergeable capture
    pub fn note_sequence(&mut self, sequence: u64) {
        self.max_sequence_number = self.max_sequence_number.max(sequence);
        match self.overflow.last_mut() {
            Some(item) => item.span.include(sequence),
            None => self.primary.span.include(sequence),
        }
    }

    fn spans(&self) -> impl Iterator<Item = SequenceSpan> + '_ {
        std::iter::once(self.primary.span).chain(self.overflow.iter().map(|item| item.span))
    }

    /// Primary plus overflow
    pub fn item_count(&self) -> usize {
        1 + self.overflow.len()
    }

    fn holds(&self, id: u64) -> bool {
        self.primary.id == id || self.overflow.iter().any(|item| item.id == id)
    }

    fn replace(&mut self, item: PendingItem) {
        if self.primary.id == item.id {
            self.primary = item;
        } else if let Some(slot) = self.overflow.iter_mut().find(|o| o.id == item.id) {
            *slot = item;
        }
    }

    fn into_items(self) -> impl Iterator<Item = PendingItem> {
        std::iter::once(self.primary).chain(self.overflow)
    }
}

/// The bucket table guarded by a [`SnapshotManager`]
#[derive(Debug)]
pub struct BucketTable {
    sample_interval: i64,
    remaining_cooldown: i64,
    cooldown_window: i64,
    buckets: BTreeMap<i64, PendingSnapshot>,
    next_item_id: u64,
}

impl BucketTable {
    fn new(sample_interval: i64, remaining_cooldown: i64, cooldown_window: i64) -> Self {
        Self {
            sample_interval: sample_interval.max(0),
            remaining_cooldown: remaining_cooldown.max(0),
            cooldown_window: cooldown_window.max(0),
            buckets: BTreeMap::new(),
            next_item_id: 1,
        }
    }

    /// Current `(sample_interval, remaining_cooldown, cooldown_window)` in milliseconds
    pub fn intervals(&self) -> (i64, i64, i64) {
        (
            self.sample_interval,
            self.remaining_cooldown,
            self.cooldown_window,
        )
    }

    /// Bucket key of `timestamp` under the current sampling interval
    pub fn window_key(&self, timestamp: i64) -> i64 {
        window_start(timestamp, self.sample_interval)
    }

    /// The still-open bucket whose window contains `timestamp`
    pub fn get_snapshot(&mut self, timestamp: i64) -> Option<&mut PendingSnapshot> {
        let key = self.window_key(timestamp);
        self.buckets.get_mut(&key)
    }

    /// Add a capture to the bucket of its window, creating the bucket if needed
    ///
    /// A capture that meets an existing bucket goes to the bucket's overflow
    /// list rather than overwriting what is there.
    pub fn add_snapshot(&mut self, item: ThingSnapshot, sequence: u64, now: i64) -> &mut PendingSnapshot {
        let id = self.next_item_id;
        self.next_item_id += 1;
        let item = PendingItem {
            id,
            snapshot: item,
            span: SequenceSpan::single(sequence),
        };
        self.insert_item(item, now)
    }

    fn insert_item(&mut self, item: PendingItem, now: i64) -> &mut PendingSnapshot {
        let sequence = item.span.last;
        let key = self.window_key(item.snapshot.timestamp);
        let expiration = window_end(
            now.saturating_add(self.remaining_cooldown),
            self.cooldown_window,
        );

        match self.buckets.entry(key) {
            Entry::Vacant(slot) => slot.insert(PendingSnapshot {
                primary: item,
                overflow: Vec::new(),
                expiration,
                max_sequence_number: sequence,
            }),
            Entry::Occupied(slot) => {
                let bucket = slot.into_mut();
                if bucket.holds(item.id) {
                    bucket.replace(item);
                } else {
                    bucket.overflow.push(item);
                }
                bucket.max_sequence_number = bucket.max_sequence_number.max(sequence);
                bucket
            }
        }
    }

    /// Reconfigure the windowing policy, re-inserting every pending capture
    pub fn update_intervals(
        &mut self,
        sample_interval: i64,
        remaining_cooldown: i64,
        cooldown_window: i64,
        now: i64,
    ) {
        self.sample_interval = sample_interval.max(0);
        self.remaining_cooldown = remaining_cooldown.max(0);
        self.cooldown_window = cooldown_window.max(0);

        let old = std::mem::take(&mut self.buckets);
        for item in old.into_values().flat_map(PendingSnapshot::into_items) {
            self.insert_item(item, now);
        }
    }

    /// Release every bucket whose expiration is at or before `now`
    ///
    /// Buckets go out in ascending window order, primary before overflow.
    /// Returns the earliest expiration still pending, `None` when empty.
    pub fn process_final_snapshots<F>(&mut self, now: i64, mut callback: F) -> Option<i64>
    where
        F: FnMut(ThingSnapshot, SequenceSpan),
    {
        let expired: Vec<i64> = self
            .buckets
            .iter()
            .filter(|(_, bucket)| bucket.expiration <= now)
            .map(|(key, _)| *key)
            .collect();

        for key in expired {
            if let Some(bucket) = self.buckets.remove(&key) {
                for item in bucket.into_items() {
                    callback(item.snapshot, item.span);
                }
            }
        }

        self.next_expiration()
    }

    /// Release everything regardless of expiration
    pub fn drain_all<F>(&mut self, mut callback: F)
    where
        F: FnMut(ThingSnapshot, SequenceSpan),
    {
        for item in std::mem::take(&mut self.buckets)
            .into_values()
            .flat_map(PendingSnapshot::into_items)
        {
            callback(item.snapshot, item.span);
        }
    }

    /// Drop everything pending
    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    /// Earliest pending expiration
    pub fn next_expiration(&self) -> Option<i64> {
        self.buckets.values().map(|b| b.expiration).min()
    }

    /// Lowest sequence number folded into any open capture
    pub fn lowest_pending_sequence(&self) -> Option<u64> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.spans())
            .map(|span| span.first)
            .min()
    }

    /// Lowest last sequence number of any open capture
    ///
    /// Open captures only grow, so everything released later ends at or
    /// above this.
    pub fn lowest_open_last_sequence(&self) -> Option<u64> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.spans())
            .map(|span| span.last)
            .min()
    }

    /// Captures waiting in all buckets
    pub fn pending_count(&self) -> usize {
        self.buckets.values().map(PendingSnapshot::item_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Thread-safe bucket aggregator
///
/// One instance handles global ingestion per thing; every consumer read
/// path owns a private one for its own sampling policy.
#[derive(Debug)]
pub struct SnapshotManager {
    table: Mutex<BucketTable>,
}

impl SnapshotManager {
    /// Create a manager; all intervals are milliseconds
    pub fn new(sample_interval: i64, remaining_cooldown: i64, cooldown_window: i64) -> Self {
        Self {
            table: Mutex::new(BucketTable::new(
                sample_interval,
                remaining_cooldown,
                cooldown_window,
            )),
        }
    }

    /// Lock the bucket table for a compound merge-or-create
    pub fn lock(&self) -> MutexGuard<'_, BucketTable> {
        self.table.lock()
    }

    /// Add a capture using the current time for its bucket's expiration
    pub fn add_snapshot(&self, item: ThingSnapshot, sequence: u64) {
        self.table.lock().add_snapshot(item, sequence, now_millis());
    }

    /// Copy of the mergeable capture in the open bucket at `timestamp`
    pub fn get_snapshot(&self, timestamp: i64) -> Option<ThingSnapshot> {
        self.table
            .lock()
            .get_snapshot(timestamp)
            .map(|bucket| bucket.mergeable().clone())
    }

    pub fn update_intervals(&self, sample_interval: i64, remaining_cooldown: i64, cooldown_window: i64) {
        self.table.lock().update_intervals(
            sample_interval,
            remaining_cooldown,
            cooldown_window,
            now_millis(),
        );
    }

    /// Release final buckets as of now; see [`BucketTable::process_final_snapshots`]
    pub fn process_final_snapshots<F>(&self, callback: F) -> Option<i64>
    where
        F: FnMut(ThingSnapshot, SequenceSpan),
    {
        self.process_final_snapshots_at(now_millis(), callback)
    }

    pub fn process_final_snapshots_at<F>(&self, now: i64, callback: F) -> Option<i64>
    where
        F: FnMut(ThingSnapshot, SequenceSpan),
    {
        self.table.lock().process_final_snapshots(now, callback)
    }

    pub fn pending_count(&self) -> usize {
        self.table.lock().pending_count()
    }

    pub fn next_expiration(&self) -> Option<i64> {
        self.table.lock().next_expiration()
    }
}
