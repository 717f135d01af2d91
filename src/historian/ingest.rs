//! Ingestion path
//!
//! Property updates are merged into the thing's global buckets under the
//! combined policy; the flush timer moves final buckets into the stream.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, trace};

use super::{propagation, retention, Historian, ThingLog};
use crate::aggregation::stats::{self, is_aggregate_property};
use crate::store::SequenceStream;
use crate::types::{Expiration, PropertyMap, ThingSnapshot};
use crate::utils::time::{ms_duration, now_millis};

/// Namespaces holding device metadata rather than history-worthy values
const META_NAMESPACES: [&str; 3] = ["[Sensor]", "[Source]", "[Config]"];

/// Whether `path` lives in a sensor, source or config namespace
pub fn is_meta_property(path: &str) -> bool {
    path.split('.')
        .any(|segment| META_NAMESPACES.iter().any(|ns| segment.starts_with(ns)))
}

pub(super) fn add_property_snapshot(
    historian: &Historian,
    thing_id: &str,
    property_path: &str,
    value: Value,
    timestamp: i64,
    sequence: u64,
) {
    if thing_id.is_empty() || property_path.is_empty() {
        debug!(thing = %thing_id, property = %property_path, "Ignoring update without thing or property");
        return;
    }
    if is_meta_property(property_path) || is_aggregate_property(property_path) {
        trace!(thing = %thing_id, property = %property_path, "Ignoring meta property");
        return;
    }

    let thing = match historian.thing(thing_id) {
        Ok(thing) => thing,
        Err(e) => {
            error!(thing = %thing_id, error = %e, "Failed to open thing log");
            return;
        }
    };

    thing
        .current_state
        .lock()
        .insert(property_path.to_string(), value.clone());

    let Some(combined) = thing.combined() else {
        return;
    };
    if !combined.includes_property(property_path) {
        return;
    }

    let aggregate = combined.aggregates.any();
    let now = now_millis();
    {
        let mut table = thing.global.lock();

        if combined.sample_window > 0 {
            if let Some(bucket) = table.get_snapshot(timestamp) {
                let target = bucket.mergeable_mut();
                if !target.is_full_snapshot && !target.properties.contains_key(property_path) {
                    stats::merge_value(&mut target.properties, property_path, value, aggregate);
                    target.timestamp = target.timestamp.max(timestamp);
                    bucket.note_sequence(sequence);
                    return;
                }
            }
        }

        if combined.needs_full_state
            && thing.stream.baseline_sequence_number() == 0
            && !thing.baseline_pending.swap(true, std::sync::atomic::Ordering::AcqRel)
        {
            let state: PropertyMap = thing
                .current_state
                .lock()
                .iter()
                .filter(|(name, _)| combined.includes_property(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            debug!(thing = %thing_id, properties = state.len(), "Queueing baseline sentinel");
            table.add_snapshot(
                ThingSnapshot::full(thing_id, timestamp, state)
                    .with_expiration(Expiration::PinnedIgnore),
                sequence,
                now,
            );
        }

        let mut snapshot = ThingSnapshot::delta(thing_id, timestamp, PropertyMap::new());
        stats::merge_value(&mut snapshot.properties, property_path, value, aggregate);
        table.add_snapshot(snapshot, sequence, now);
    }

    thing
        .scheduler
        .arm(ms_duration(combined.flush_delay()).max(historian.config.min_timer_wait));
}

fn append(stream: &dyn SequenceStream, item: ThingSnapshot, max_sequence: u64) -> Option<u64> {
    let thing_id = item.thing_id.clone();
    match stream.add_item(item) {
        Ok(seq) => {
            trace!(thing = %thing_id, seq, source_seq = max_sequence, "Appended snapshot");
            Some(seq)
        }
        Err(e) => {
            error!(thing = %thing_id, error = %e, "Failed to append snapshot");
            None
        }
    }
}

/// Move every final global bucket into the stream
///
/// Returns how many records were appended and the next pending expiration.
pub(crate) fn flush_final(thing: &ThingLog) -> (usize, Option<i64>) {
    let stream = thing.stream.as_ref();
    let mut appended = 0;
    let mut baseline_written = false;

    let next = thing.global.process_final_snapshots(|item, span| {
        let is_baseline = item.is_baseline();
        if append(stream, item, span.last).is_some() {
            appended += 1;
            baseline_written |= is_baseline;
        }
    });

    if baseline_written {
        thing
            .baseline_pending
            .store(false, std::sync::atomic::Ordering::Release);
    }
    (appended, next)
}

/// Move every global bucket into the stream, final or not
pub(crate) fn flush_all(thing: &ThingLog) -> usize {
    let stream = thing.stream.as_ref();
    let mut appended = 0;
    thing.global.lock().drain_all(|item, span| {
        if append(stream, item, span.last).is_some() {
            appended += 1;
        }
    });
    thing
        .baseline_pending
        .store(false, std::sync::atomic::Ordering::Release);
    appended
}

/// Flush timer body; returns the delay until the next tick
pub(super) fn on_snapshot_timer(historian: &Historian, thing_id: &str) -> Option<Duration> {
    let thing = historian.existing_thing(thing_id)?;
    let (appended, next) = flush_final(&thing);
    if appended > 0 {
        debug!(thing = %thing_id, appended, "Flushed final buckets");
        propagation::propagate_updates(historian, &thing);
    }

    retention::maybe_cleanup(historian);

    let next = next?;
    let mut wait = ms_duration(next - now_millis());
    if let Some(combined) = thing.combined() {
        let ceiling = combined.flush_delay();
        if ceiling > 0 {
            wait = wait.min(ms_duration(ceiling));
        }
    }
    if historian.is_shutting_down() {
        wait = wait.min(historian.config.shutdown_poll);
    }
    Some(wait.max(Duration::from_millis(1)))
}

/// Latest value of every property recorded in `stream`
pub(super) fn restore_state(stream: &dyn SequenceStream) -> PropertyMap {
    let from = stream
        .find_last_item_at_or_before(u64::MAX, &|s| s.is_full_snapshot)
        .map(|s| s.sequence_number)
        .unwrap_or(0);

    let mut state = PropertyMap::new();
    let (items, _) = stream.get_items(from);
    for item in items.iter().flatten() {
        item.apply_to(&mut state);
    }
    state.retain(|name, _| !is_aggregate_property(name));
    state
}
