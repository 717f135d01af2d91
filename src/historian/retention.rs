//! Retention: token expiry, baseline maintenance and stream compaction
//!
//! A stream is never compacted past the lowest acknowledged cursor of its
//! consumers. When any of them reads full state, the baseline is first
//! rolled forward to that cursor so it survives the compaction.

use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use super::{Historian, ThingLog};
use crate::aggregation::stats::is_aggregate_property;
use crate::error::HistorianResult;
use crate::types::{ConsumerToken, PropertyMap, ThingSnapshot};
use crate::utils::time::now_millis;

pub(super) fn clear_unused_history(historian: &Historian) -> bool {
    *historian.last_cleanup.lock() = Instant::now();
    let now = now_millis();

    let expired: Vec<ConsumerToken> = historian
        .consumers
        .read()
        .values()
        .filter(|c| {
            c.registration
                .lock()
                .is_expired(now, historian.config.default_token_expiration)
        })
        .map(|c| c.token)
        .collect();
    for token in &expired {
        info!(token = %token, "Expiring idle consumer");
        historian.unregister_consumer(*token);
    }

    let things: Vec<Arc<ThingLog>> = historian.things.read().values().cloned().collect();
    let failures = things
        .par_iter()
        .filter(|thing| match compact_thing(historian, thing) {
            Ok(_) => false,
            Err(e) => {
                warn!(thing = %thing.thing_id, error = %e, "Compaction failed");
                true
            }
        })
        .count();

    if let Err(e) = historian.registrations.save() {
        warn!(error = %e, "Failed to save registrations");
        return false;
    }

    debug!(
        expired = expired.len(),
        things = things.len(),
        failures,
        "Retention cleanup finished"
    );
    failures == 0
}

/// Run retention when the cleanup interval has elapsed
pub(super) fn maybe_cleanup(historian: &Historian) {
    {
        let mut last = historian.last_cleanup.lock();
        if last.elapsed() < historian.config.cleanup_interval {
            return;
        }
        *last = Instant::now();
    }

    match (&historian.runtime, historian.self_ref.upgrade()) {
        (Some(handle), Some(historian)) => {
            handle.spawn_blocking(move || historian.clear_unused_history());
        }
        _ => {
            clear_unused_history(historian);
        }
    }
}

/// Compact one thing's stream up to its lowest acknowledged cursor
///
/// Things without consumers are compacted entirely (the baseline stays).
pub(super) fn compact_thing(historian: &Historian, thing: &ThingLog) -> HistorianResult<usize> {
    let stream = thing.stream.as_ref();
    let consumers = historian.consumers_of(&thing.thing_id);

    let (lowest, needs_full_state) = if consumers.is_empty() {
        (stream.last_sequence_number(), false)
    } else {
        let mut lowest = u64::MAX;
        let mut full = false;
        for consumer in &consumers {
            let registration = consumer.registration.lock();
            lowest = lowest.min(registration.sequence_number_truncated);
            full |= registration.parameters.report_unchanged_properties;
        }
        (lowest, full)
    };

    if lowest == 0 || stream.is_empty() {
        return Ok(0);
    }

    let removed = if needs_full_state {
        match rebuild_baseline(thing, lowest)? {
            Some(target) => stream.delete_items_up_to(stream.previous_sequence_number(target)),
            None => 0,
        }
    } else {
        stream.delete_items_up_to(lowest)
    };

    stream.save()?;
    Ok(removed)
}

/// Roll the baseline forward to the newest record at or before `lowest`
///
/// Returns the sequence number of the baseline, `None` when there is
/// nothing at or before `lowest` to build one from.
fn rebuild_baseline(thing: &ThingLog, lowest: u64) -> HistorianResult<Option<u64>> {
    let stream = thing.stream.as_ref();

    let (from, mut state, mut timestamp, baseline_seq) =
        match stream.find_last_item_at_or_before(lowest, &|s| s.is_baseline()) {
            Some(baseline) => (
                baseline.sequence_number,
                baseline.properties,
                baseline.timestamp,
                baseline.sequence_number,
            ),
            None => {
                error!(
                    thing = %thing.thing_id,
                    lowest,
                    "No baseline at or before the oldest cursor, rebuilding from the first record"
                );
                (stream.first_sequence_number(), PropertyMap::new(), 0, 0)
            }
        };

    let mut target = 0;
    let (items, _) = stream.get_items(from);
    for item in items
        .iter()
        .flatten()
        .take_while(|item| item.sequence_number <= lowest)
    {
        item.apply_to(&mut state);
        timestamp = item.timestamp;
        target = item.sequence_number;
    }

    if target == 0 {
        return Ok(None);
    }
    if target != baseline_seq {
        state.retain(|name, _| !is_aggregate_property(name));
        stream.set_baseline(target, ThingSnapshot::full(&thing.thing_id, timestamp, state))?;
        debug!(thing = %thing.thing_id, from = baseline_seq, to = target, "Rolled baseline forward");
    }
    Ok(Some(target))
}

pub(super) fn delete_thing_history(historian: &Historian, thing_id: &str) -> bool {
    let consumers_removed = historian.unregister_all_consumers_for_owner(thing_id);

    let Some(thing) = historian.things.write().remove(thing_id) else {
        return consumers_removed;
    };

    thing.scheduler.disarm();
    thing.global.lock().clear();
    thing
        .baseline_pending
        .store(false, std::sync::atomic::Ordering::Release);
    thing.current_state.lock().clear();

    let stream_removed = match thing.stream.remove() {
        Ok(()) => true,
        Err(e) => {
            warn!(thing = %thing_id, error = %e, "Failed to remove stream");
            false
        }
    };

    info!(thing = %thing_id, "Deleted thing history");
    consumers_removed && stream_removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HistorianConfig;
    use crate::types::{Expiration, HistoryParameters};
    use serde_json::json;
    use std::time::Duration;

    fn historian() -> Arc<Historian> {
        Historian::new(HistorianConfig::default()).unwrap()
    }

    fn add_delta(thing: &ThingLog, ts: i64, name: &str, value: i64) -> u64 {
        thing
            .stream
            .add_item(ThingSnapshot::delta("pump", ts, PropertyMap::new()).with_property(name, json!(value)))
            .unwrap()
    }

    fn acknowledge(historian: &Historian, token: ConsumerToken, seq: u64) {
        let consumer = historian.consumer(&token).unwrap();
        let mut registration = consumer.registration.lock();
        registration.advance_read(seq);
        registration.clear();
    }

    #[test]
    fn test_compaction_stops_at_lowest_cursor() {
        let h = historian();
        let a = h.register_consumer("pump", HistoryParameters::new(), None).unwrap();
        let b = h.register_consumer("pump", HistoryParameters::new(), None).unwrap();
        let thing = h.existing_thing("pump").unwrap();
        for i in 1..=6 {
            add_delta(&thing, i * 100, "Temp", i);
        }

        acknowledge(&h, a, 4);
        acknowledge(&h, b, 2);

        assert_eq!(compact_thing(&h, &thing).unwrap(), 2);
        assert_eq!(thing.stream.first_sequence_number(), 3);
    }

    #[test]
    fn test_baseline_rolls_forward_for_full_state_consumer() {
        let h = historian();
        let token = h
            .register_consumer("pump", HistoryParameters::new().full_state(), None)
            .unwrap();
        let thing = h.existing_thing("pump").unwrap();
        assert_eq!(thing.stream.baseline_sequence_number(), 1);

        add_delta(&thing, 100, "A", 1);
        add_delta(&thing, 200, "B", 2);
        add_delta(&thing, 300, "A", 3);
        add_delta(&thing, 400, "C", 4);

        let mut expected = PropertyMap::new();
        let (items, _) = thing.stream.get_items(0);
        for item in items.iter().flatten() {
            item.apply_to(&mut expected);
        }

        acknowledge(&h, token, 4);
        assert!(h.clear_unused_history());

        assert_eq!(thing.stream.baseline_sequence_number(), 4);
        assert_eq!(thing.stream.first_sequence_number(), 4);

        let (items, first) = thing.stream.get_items(0);
        assert_eq!(first, 4);
        let baseline = items[0].as_ref().unwrap();
        assert_eq!(baseline.expiration, Expiration::Pinned);
        assert_eq!(baseline.get("A"), Some(&json!(3)));
        assert_eq!(baseline.get("B"), Some(&json!(2)));

        let mut rebuilt = PropertyMap::new();
        for item in items.iter().flatten() {
            item.apply_to(&mut rebuilt);
        }
        assert_eq!(rebuilt, expected);
    }

    #[test]
    fn test_missing_baseline_falls_back_to_first_record() {
        let h = historian();
        let token = h.register_consumer("pump", HistoryParameters::new(), None).unwrap();
        let thing = h.existing_thing("pump").unwrap();
        add_delta(&thing, 100, "A", 1);
        add_delta(&thing, 200, "B", 2);
        add_delta(&thing, 300, "A", 5);

        // Switch the consumer to full state behind the historian's back
        {
            let consumer = h.consumer(&token).unwrap();
            consumer.registration.lock().parameters.report_unchanged_properties = true;
        }
        acknowledge(&h, token, 2);

        compact_thing(&h, &thing).unwrap();
        assert_eq!(thing.stream.baseline_sequence_number(), 2);
        let (items, first) = thing.stream.get_items(0);
        assert_eq!(first, 2);
        assert_eq!(items[0].as_ref().unwrap().properties.len(), 2);
    }

    #[test]
    fn test_idle_tokens_expire() {
        let h = historian();
        let token = h
            .register_consumer(
                "pump",
                HistoryParameters::new().with_token_expiration(Duration::from_secs(1)),
                None,
            )
            .unwrap();
        {
            let consumer = h.consumer(&token).unwrap();
            consumer.registration.lock().last_access = now_millis() - 2_000;
        }

        h.clear_unused_history();
        assert!(h.get_history_parameters(token).is_none());
        assert_eq!(h.stats().consumer_count, 0);
    }

    #[test]
    fn test_thing_without_consumers_is_compacted() {
        let h = historian();
        let thing = h.thing("pump").unwrap();
        for i in 1..=3 {
            add_delta(&thing, i * 100, "Temp", i);
        }
        assert_eq!(compact_thing(&h, &thing).unwrap(), 3);
        assert!(thing.stream.is_empty());
        assert_eq!(thing.stream.last_sequence_number(), 3);
    }

    #[test]
    fn test_delete_thing_history() {
        let h = historian();
        h.register_consumer("pump", HistoryParameters::new(), None).unwrap();
        h.add_property_snapshot("pump", "Temp", json!(1), 100, 1);

        assert!(h.delete_thing_history("pump"));
        assert!(h.existing_thing("pump").is_none());
        assert_eq!(h.stats().consumer_count, 0);
        assert!(h.delete_thing_history("pump"));
    }
}
