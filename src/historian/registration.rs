//! Consumer registration lifecycle

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{propagation, retention, Consumer, Historian, ThingLog};
use crate::error::HistorianResult;
use crate::store::MaterializedStore;
use crate::types::{
    ConsumerRegistration, ConsumerToken, Expiration, HistoryParameters, ThingSnapshot,
};
use crate::utils::time::now_millis;

/// Recreate consumers from the persisted registration table
pub(super) fn restore_consumers(historian: &Historian) -> HistorianResult<usize> {
    let registrations = historian.registrations.load_all();
    let mut things = HashSet::new();

    for registration in &registrations {
        let thing = historian.thing(&registration.thing_id)?;
        things.insert(registration.thing_id.clone());

        // Cursors are saved on every read, streams only periodically. A
        // cursor past the saved stream must not swallow new appends.
        let cursor = registration
            .last_sequence_number_read
            .max(registration.highest_initial_value_sequence_number);
        if thing.stream.skip_past(cursor) {
            warn!(
                token = %registration.token,
                thing = %registration.thing_id,
                cursor,
                "Consumer cursor is ahead of the saved stream"
            );
        }

        let consumer = Arc::new(Consumer::new(registration.clone(), None));
        historian
            .consumers
            .write()
            .insert(consumer.token, consumer);
    }

    for thing_id in things {
        if let Some(thing) = historian.existing_thing(&thing_id) {
            historian.recompute_combined(&thing);
        }
    }
    Ok(registrations.len())
}

pub(super) fn register_consumer(
    historian: &Historian,
    thing_id: &str,
    parameters: HistoryParameters,
    store: Option<Arc<dyn MaterializedStore>>,
) -> HistorianResult<ConsumerToken> {
    let thing = historian.thing(thing_id)?;
    let token = ConsumerToken::new();
    let report_initial_values = parameters.report_initial_values;

    if parameters.report_unchanged_properties {
        ensure_baseline(&thing)?;
    }

    // New consumers start at the live point.
    let start = thing.stream.last_sequence_number();
    let registration =
        ConsumerRegistration::new(token, thing_id, parameters, start, now_millis());
    historian.registrations.upsert(&registration)?;

    let consumer = Arc::new(Consumer::new(registration, store));
    historian
        .consumers
        .write()
        .insert(token, consumer.clone());
    historian.recompute_combined(&thing);

    if report_initial_values {
        append_initial_values(&thing)?;
    }

    info!(token = %token, thing = %thing_id, start_seq = start, "Registered history consumer");

    if consumer.store().is_some() {
        propagation::trigger(historian, consumer);
    }
    Ok(token)
}

pub(super) fn unregister_consumer(historian: &Historian, token: ConsumerToken) -> bool {
    let Some(consumer) = historian.consumers.write().remove(&token) else {
        return false;
    };

    if let Err(e) = historian.registrations.remove(&token) {
        warn!(token = %token, error = %e, "Failed to drop persisted registration");
    }
    if let Some(store) = consumer.store.lock().take() {
        if let Err(e) = store.remove_store() {
            warn!(token = %token, error = %e, "Failed to remove dedicated store");
        }
    }
    if let Some(thing) = historian.existing_thing(&consumer.thing_id) {
        historian.recompute_combined(&thing);
    }

    info!(token = %token, thing = %consumer.thing_id, "Unregistered history consumer");
    true
}

pub(super) fn unregister_all_consumers_for_owner(historian: &Historian, thing_id: &str) -> bool {
    let tokens: Vec<ConsumerToken> = historian
        .consumers_of(thing_id)
        .iter()
        .map(|c| c.token)
        .collect();

    let removed = tokens
        .iter()
        .filter(|token| unregister_consumer(historian, **token))
        .count();
    debug!(thing = %thing_id, removed, "Unregistered consumers of thing");
    removed == tokens.len()
}

pub(super) fn get_history_parameters(
    historian: &Historian,
    token: ConsumerToken,
) -> Option<HistoryParameters> {
    let consumer = historian.consumer(&token)?;
    let mut registration = consumer.registration.lock();
    registration.touch(now_millis());
    Some(registration.parameters.clone())
}

pub(super) fn restart_history(
    historian: &Historian,
    token: ConsumerToken,
    parameters: HistoryParameters,
    store: Option<Arc<dyn MaterializedStore>>,
) -> bool {
    let Some(consumer) = historian.consumer(&token) else {
        return false;
    };
    let thing = match historian.thing(&consumer.thing_id) {
        Ok(thing) => thing,
        Err(e) => {
            error!(token = %token, error = %e, "Failed to open thing log");
            return false;
        }
    };

    if parameters.report_unchanged_properties {
        if let Err(e) = ensure_baseline(&thing) {
            error!(token = %token, error = %e, "Failed to create baseline");
            return false;
        }
    }

    let (registration, wants_initial_values) = {
        let mut registration = consumer.registration.lock();
        registration.restart(parameters);
        registration.touch(now_millis());
        let wants = registration.parameters.report_initial_values
            && registration.highest_initial_value_sequence_number == 0;
        (registration.clone(), wants)
    };
    if let Some(store) = store {
        *consumer.store.lock() = Some(store);
    }

    historian.recompute_combined(&thing);
    if wants_initial_values {
        if let Err(e) = append_initial_values(&thing) {
            warn!(token = %token, error = %e, "Failed to append initial values");
        }
    }
    persist(historian, &registration);

    info!(
        token = %token,
        resume_seq = registration.last_sequence_number_read,
        "Restarted history"
    );
    true
}

pub(super) fn clear_history(historian: &Historian, token: ConsumerToken) -> bool {
    let Some(consumer) = historian.consumer(&token) else {
        return false;
    };

    let registration = {
        let mut registration = consumer.registration.lock();
        registration.clear();
        registration.touch(now_millis());
        registration.clone()
    };
    persist(historian, &registration);

    if let Some(thing) = historian.existing_thing(&consumer.thing_id) {
        if let Err(e) = retention::compact_thing(historian, &thing) {
            warn!(thing = %thing.thing_id, error = %e, "Compaction after clear failed");
        }
    }
    true
}

pub(super) fn set_history_cursor(historian: &Historian, token: ConsumerToken, timestamp: i64) -> bool {
    let Some(consumer) = historian.consumer(&token) else {
        return false;
    };
    let thing = match historian.thing(&consumer.thing_id) {
        Ok(thing) => thing,
        Err(e) => {
            error!(token = %token, error = %e, "Failed to open thing log");
            return false;
        }
    };

    let offset = thing.stream.offset_by_timestamp(timestamp);
    let target = thing.stream.previous_sequence_number(offset);

    let registration = {
        let mut registration = consumer.registration.lock();
        registration.rewind_to(target);
        registration.touch(now_millis());
        registration.clone()
    };
    persist(historian, &registration);

    debug!(token = %token, timestamp, seq = target, "Moved history cursor");
    true
}

fn persist(historian: &Historian, registration: &ConsumerRegistration) {
    if let Err(e) = historian.registrations.upsert(registration) {
        warn!(token = %registration.token, error = %e, "Failed to save registration");
    }
}

/// Make sure the stream holds a baseline at or before its current end
///
/// A sentinel still sitting in a global bucket is flushed first so the
/// baseline lands before the caller's cursor.
fn ensure_baseline(thing: &ThingLog) -> HistorianResult<()> {
    let mut table = thing.global.lock();
    if thing.stream.baseline_sequence_number() != 0 {
        return Ok(());
    }

    if thing
        .baseline_pending
        .swap(false, std::sync::atomic::Ordering::AcqRel)
    {
        let stream = thing.stream.as_ref();
        table.drain_all(|item, _| {
            if let Err(e) = stream.add_item(item) {
                error!(thing = %thing.thing_id, error = %e, "Failed to append snapshot");
            }
        });
        if stream.baseline_sequence_number() != 0 {
            return Ok(());
        }
    }

    let state = thing.current_state.lock().clone();
    let seq = thing.stream.add_item(
        ThingSnapshot::full(&thing.thing_id, now_millis(), state)
            .with_expiration(Expiration::PinnedIgnore),
    )?;
    debug!(thing = %thing.thing_id, seq, "Created baseline sentinel");
    Ok(())
}

/// Append the thing's current values as an initial-value record
fn append_initial_values(thing: &ThingLog) -> HistorianResult<Option<u64>> {
    let state = thing.current_state.lock().clone();
    if state.is_empty() {
        return Ok(None);
    }
    let seq = thing
        .stream
        .add_item(ThingSnapshot::full(&thing.thing_id, now_millis(), state).as_initial_value())?;
    debug!(thing = %thing.thing_id, seq, "Appended initial values");
    Ok(Some(seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HistorianConfig;
    use std::time::Duration;

    fn historian() -> Arc<Historian> {
        Historian::new(HistorianConfig::default()).unwrap()
    }

    #[test]
    fn test_combined_follows_registrations() {
        let h = historian();
        let a = h
            .register_consumer(
                "pump",
                HistoryParameters::new().with_sample_window(Duration::from_secs(5)),
                None,
            )
            .unwrap();
        let b = h
            .register_consumer(
                "pump",
                HistoryParameters::new().with_sample_window(Duration::from_secs(1)),
                None,
            )
            .unwrap();

        let thing = h.existing_thing("pump").unwrap();
        assert_eq!(thing.combined().unwrap().sample_window, 1_000);

        assert!(h.unregister_consumer(b));
        assert_eq!(thing.combined().unwrap().sample_window, 5_000);

        assert!(h.unregister_consumer(a));
        assert!(thing.combined().is_none());
        assert!(!h.unregister_consumer(a));
    }

    #[test]
    fn test_unknown_token_is_rejected() {
        let h = historian();
        let token = ConsumerToken::new();
        assert!(h.get_history_parameters(token).is_none());
        assert!(!h.clear_history(token));
        assert!(!h.restart_history(token, HistoryParameters::new(), None));
        assert!(!h.set_history_cursor(token, 0));
    }

    #[test]
    fn test_full_state_registration_creates_baseline_before_cursor() {
        let h = historian();
        h.add_property_snapshot("pump", "Temp", serde_json::json!(5), 1_000, 1);
        let token = h
            .register_consumer("pump", HistoryParameters::new().full_state(), None)
            .unwrap();

        let thing = h.existing_thing("pump").unwrap();
        let baseline = thing.stream.baseline_sequence_number();
        assert_eq!(baseline, 1);

        let consumer = h.consumer(&token).unwrap();
        assert_eq!(consumer.registration.lock().last_sequence_number_read, baseline);
    }

    #[test]
    fn test_initial_values_land_after_cursor() {
        let h = historian();
        h.add_property_snapshot("pump", "Temp", serde_json::json!(5), 1_000, 1);
        let token = h
            .register_consumer("pump", HistoryParameters::new().initial_values(), None)
            .unwrap();

        let thing = h.existing_thing("pump").unwrap();
        let consumer = h.consumer(&token).unwrap();
        let cursor = consumer.registration.lock().last_sequence_number_read;
        let (items, first) = thing.stream.get_items(cursor + 1);
        assert_eq!(first, cursor + 1);
        assert!(items[0].as_ref().unwrap().is_initial_value);
    }

    #[test]
    fn test_set_history_cursor_rewinds() {
        let h = historian();
        let token = h
            .register_consumer("pump", HistoryParameters::new(), None)
            .unwrap();
        let thing = h.existing_thing("pump").unwrap();
        for ts in [100, 200, 300] {
            thing
                .stream
                .add_item(ThingSnapshot::delta("pump", ts, Default::default()))
                .unwrap();
        }

        assert!(h.set_history_cursor(token, 150));
        let consumer = h.consumer(&token).unwrap();
        let registration = consumer.registration.lock();
        assert_eq!(registration.last_sequence_number_read, 1);
        assert_eq!(registration.sequence_number_truncated, 0);
    }
}
