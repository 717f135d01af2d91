//! Retrieval path
//!
//! Each read scans the stream from the consumer's cursor, re-buckets what
//! it finds under the consumer's own policy and hands out the buckets that
//! are final. Reads of one token are serialized by its read-state lock.
//!
//! A late record can raise an older window's sequence number above that of
//! a newer window still open. Final items therefore wait until no open
//! capture could come out below them, and the cursor never passes the
//! lowest sequence number still held back.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

use super::{ingest, Consumer, Historian, ThingLog};
use crate::aggregation::stats::{self, is_aggregate_property};
use crate::aggregation::{BucketTable, SequenceSpan, SnapshotManager};
use crate::error::{HistorianError, HistorianResult};
use crate::types::{
    ConsumerRegistration, ConsumerToken, Expiration, HistoryParameters, HistoryResponse,
    PropertyMap, ThingSnapshot,
};
use crate::utils::time::{duration_ms, ms_duration, now_millis};

/// Per-consumer second-level aggregation state
pub(crate) struct ReadState {
    aggregator: SnapshotManager,
    /// Final items not yet handed out, ordered by their last sequence number
    ready: VecDeque<(ThingSnapshot, SequenceSpan)>,
    /// Full state as of the last item handed out (full-state consumers)
    running: Option<PropertyMap>,
    /// Highest sequence number already fed into `aggregator`
    highest_fed: u64,
    generation: u64,
}

impl ReadState {
    pub(crate) fn new(registration: &ConsumerRegistration) -> Self {
        Self {
            aggregator: SnapshotManager::new(0, 0, 0),
            ready: VecDeque::new(),
            running: None,
            highest_fed: registration.last_sequence_number_read,
            generation: registration.generation,
        }
    }

    fn reset(&mut self, last_read: u64, generation: u64) {
        self.aggregator.lock().clear();
        self.ready.clear();
        self.running = None;
        self.highest_fed = last_read;
        self.generation = generation;
    }

    fn pending_count(&self) -> usize {
        self.aggregator.pending_count() + self.ready.len()
    }
}

pub(super) async fn get_history(
    historian: &Historian,
    token: ConsumerToken,
    max_count: Option<usize>,
    min_count: usize,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    clear_history: bool,
) -> Option<HistoryResponse> {
    let consumer = historian.consumer(&token)?;
    let thing = match historian.thing(&consumer.thing_id) {
        Ok(thing) => thing,
        Err(e) => {
            error!(token = %token, error = %e, "Failed to open thing log");
            return None;
        }
    };

    let mut state = consumer.read_state.lock().await;
    let request = ReadRequest {
        max_count,
        min_count,
        timeout,
        clear_history,
    };
    match read(historian, &consumer, &thing, &mut state, request, cancel).await {
        Ok(response) => Some(response),
        Err(e) => {
            error!(token = %token, error = %e, "History read failed");
            None
        }
    }
}

struct ReadRequest {
    max_count: Option<usize>,
    min_count: usize,
    timeout: Option<Duration>,
    clear_history: bool,
}

async fn read(
    historian: &Historian,
    consumer: &Consumer,
    thing: &ThingLog,
    state: &mut ReadState,
    request: ReadRequest,
    cancel: &CancellationToken,
) -> HistorianResult<HistoryResponse> {
    let config = &historian.config;
    let wait = request
        .timeout
        .unwrap_or(config.max_wait)
        .min(config.max_wait);
    let deadline = Instant::now() + wait;

    let (params, mut last_read, generation) = {
        let mut registration = consumer.registration.lock();
        registration.touch(now_millis());
        (
            registration.parameters.clone(),
            registration.last_sequence_number_read,
            registration.generation,
        )
    };
    if state.generation != generation {
        state.reset(last_read, generation);
    }
    configure_aggregator(historian, thing, &params, state);

    let mut response = HistoryResponse::default();
    if params.report_unchanged_properties && state.running.is_none() {
        let (base, data_loss) = base_state(thing, last_read);
        response.data_loss_detected |= data_loss;
        state.running = Some(base);
    }

    loop {
        let mut updates = thing.stream.subscribe();
        updates.borrow_and_update();
        ingest::flush_final(thing);

        response.data_loss_detected |= feed(consumer, thing, &params, state, last_read);
        let next_expiration = release(state, now_millis());

        let room = request
            .max_count
            .map(|max| max.saturating_sub(response.len()));
        if let Some(cursor) = deliver(state, &params, room, &mut response.history_items) {
            last_read = last_read.max(cursor);
            if !commit(historian, consumer, generation, last_read)? {
                break;
            }
        }

        let full = request
            .max_count
            .map_or(false, |max| response.len() >= max);
        if response.len() >= request.min_count || full || cancel.is_cancelled() {
            break;
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let mut wake = deadline;
        let next_expiration = [next_expiration, thing.global.next_expiration()]
            .into_iter()
            .flatten()
            .min();
        if let Some(expiration) = next_expiration {
            wake = wake.min(now + ms_duration(expiration - now_millis()));
        }
        if historian.is_shutting_down() {
            wake = wake.min(now + config.shutdown_poll);
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = sleep_until(wake) => {}
        }
    }

    if request.clear_history && !response.is_empty() {
        let registration = {
            let mut registration = consumer.registration.lock();
            if registration.generation == generation {
                registration.clear();
            }
            registration.clone()
        };
        if let Err(e) = historian.registrations.upsert(&registration) {
            warn!(token = %consumer.token, error = %e, "Failed to save registration");
        }
    }

    response.pending_item_count = state.pending_count();
    trace!(
        token = %consumer.token,
        items = response.len(),
        pending = response.pending_item_count,
        last_read,
        "History read"
    );
    Ok(response)
}

fn configure_aggregator(
    historian: &Historian,
    thing: &ThingLog,
    params: &HistoryParameters,
    state: &ReadState,
) {
    let window = params.sample_window_ms();
    let min_cooldown = duration_ms(historian.config.min_cooldown);
    let remaining = match thing.combined() {
        Some(combined) => combined.remaining_cooldown(params, min_cooldown),
        None => params.cooldown_ms().max(min_cooldown),
    };

    let mut table = state.aggregator.lock();
    if table.intervals() != (window, remaining, window) {
        table.update_intervals(window, remaining, window, now_millis());
    }
}

/// Full state as of `last_read`, and whether part of it had to be guessed
fn base_state(thing: &ThingLog, last_read: u64) -> (PropertyMap, bool) {
    let stream = thing.stream.as_ref();
    let mut data_loss = false;

    let from = match stream.find_last_item_at_or_before(last_read, &|s| s.is_baseline()) {
        Some(baseline) => baseline.sequence_number,
        None => {
            let first = stream.first_sequence_number();
            if first != 0 && first <= last_read {
                error!(
                    thing = %thing.thing_id,
                    last_read,
                    "No baseline at or before the cursor, rebuilding from the first record"
                );
                data_loss = true;
            }
            first
        }
    };

    let mut state = PropertyMap::new();
    let (items, first) = stream.get_items(from);
    for (offset, entry) in items.iter().enumerate() {
        if first + offset as u64 > last_read {
            break;
        }
        match entry {
            Some(item) => item.apply_to(&mut state),
            None => data_loss = true,
        }
    }
    state.retain(|name, _| !is_aggregate_property(name));
    (state, data_loss)
}

/// Feed new stream records into the consumer's buckets; returns data loss
fn feed(
    consumer: &Consumer,
    thing: &ThingLog,
    params: &HistoryParameters,
    state: &mut ReadState,
    last_read: u64,
) -> bool {
    let stream = thing.stream.as_ref();
    let scan_from = stream.next_sequence_number(last_read.max(state.highest_fed));
    let (items, first) = stream.get_items(scan_from);
    let mut data_loss = first != scan_from;
    if data_loss {
        warn!(
            token = %consumer.token,
            requested = scan_from,
            available = first,
            "History compacted past the cursor"
        );
    }

    let now = now_millis();
    let oldest = params.max_age.map(|age| now - duration_ms(age));
    let full_state = params.report_unchanged_properties;
    let initial_before = consumer
        .registration
        .lock()
        .highest_initial_value_sequence_number;
    let mut highest_initial = initial_before;

    let mut candidates = Vec::new();
    for (offset, entry) in items.into_iter().enumerate() {
        let seq = first + offset as u64;
        state.highest_fed = state.highest_fed.max(seq);

        let Some(mut item) = entry else {
            data_loss = true;
            continue;
        };

        if item.is_initial_value {
            if !params.report_initial_values || highest_initial != 0 {
                continue;
            }
            highest_initial = seq;
        } else if item.is_full_snapshot
            && (item.expiration == Expiration::PinnedIgnore || !full_state)
        {
            continue;
        }

        if oldest.map_or(false, |oldest| item.timestamp < oldest) {
            continue;
        }

        item.properties
            .retain(|name, _| params.includes_property(name));
        if item.properties.is_empty() && !item.is_full_snapshot {
            continue;
        }
        candidates.push(item);
    }

    if highest_initial != initial_before {
        consumer
            .registration
            .lock()
            .highest_initial_value_sequence_number = highest_initial;
    }

    if let Some(max) = params.max_count {
        if candidates.len() > max {
            let excess = candidates.len() - max;
            candidates.drain(..excess);
        }
    }

    let window = params.sample_window_ms();
    let aggregate = params.aggregates.any();
    let mut table = state.aggregator.lock();
    for item in candidates {
        feed_item(&mut table, item, window, aggregate, now);
    }

    data_loss
}

/// Merge one record into the consumer's buckets
///
/// Every record of a window merges into its bucket; full records and
/// zero-width windows always get a capture of their own.
fn feed_item(table: &mut BucketTable, item: ThingSnapshot, window: i64, aggregate: bool, now: i64) {
    let seq = item.sequence_number;
    if window > 0 && !item.is_full_snapshot {
        if let Some(bucket) = table.get_snapshot(item.timestamp) {
            let target = bucket.mergeable_mut();
            if !target.is_full_snapshot {
                stats::merge_snapshot(target, &item, aggregate);
                target.sequence_number = target.sequence_number.max(seq);
                bucket.note_sequence(seq);
                return;
            }
        }
    }
    table.add_snapshot(item, seq, now);
}

/// Move final buckets to the ready queue; returns the next pending expiration
fn release(state: &mut ReadState, now: i64) -> Option<i64> {
    let ready = &mut state.ready;
    let next = state
        .aggregator
        .process_final_snapshots_at(now, |item, span| ready.push_back((item, span)));
    ready.make_contiguous().sort_by_key(|(_, span)| span.last);
    next
}

/// Hand out ready items in sequence order
///
/// Returns the cursor the delivery allows: the last sequence number handed
/// out, capped below anything still pending.
fn deliver(
    state: &mut ReadState,
    params: &HistoryParameters,
    room: Option<usize>,
    out: &mut Vec<ThingSnapshot>,
) -> Option<u64> {
    let open_last = state.aggregator.lock().lowest_open_last_sequence();
    let mut highest = None;
    let mut delivered = 0;

    while room.map_or(true, |room| delivered < room) {
        match state.ready.front() {
            Some((_, span)) if open_last.map_or(true, |open| span.last < open) => {}
            _ => break,
        }
        let Some((mut item, span)) = state.ready.pop_front() else {
            break;
        };

        // The running state never holds statistics, so the only ones left
        // on the rebuilt item are this item's own.
        if let Some(current) = state.running.as_mut() {
            let full = item.clone_for_thing_snapshot(current);
            current.clone_from(&full.properties);
            current.retain(|name, _| !is_aggregate_property(name));

            item = full;
            item.properties
                .retain(|name, _| params.includes_property(name));
        }

        stats::retain_requested(&mut item.properties, params.aggregates);
        highest = Some(span.last);
        out.push(item);
        delivered += 1;
    }

    let highest = highest?;
    let pending = [
        state.aggregator.lock().lowest_pending_sequence(),
        state.ready.iter().map(|(_, span)| span.first).min(),
    ]
    .into_iter()
    .flatten()
    .min();
    Some(match pending {
        Some(first) => highest.min(first.saturating_sub(1)),
        None => highest,
    })
}

/// Record delivery up to `last_read`
///
/// Returns false when the cursor was reset by another call meanwhile.
fn commit(
    historian: &Historian,
    consumer: &Consumer,
    generation: u64,
    last_read: u64,
) -> HistorianResult<bool> {
    if !historian.consumers.read().contains_key(&consumer.token) {
        return Err(HistorianError::UnknownToken(consumer.token));
    }

    let registration = {
        let mut registration = consumer.registration.lock();
        if registration.generation != generation {
            return Ok(false);
        }
        registration.advance_read(last_read);
        registration.touch(now_millis());
        registration.clone()
    };

    if registration.parameters.persistent {
        if let Err(e) = historian.registrations.upsert(&registration) {
            warn!(token = %consumer.token, error = %e, "Failed to save registration");
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HistorianConfig;
    use crate::types::AggregateFlags;
    use serde_json::json;
    use std::sync::Arc;

    fn delta(seq: u64, ts: i64, name: &str, value: i64) -> ThingSnapshot {
        let mut item =
            ThingSnapshot::delta("pump", ts, PropertyMap::new()).with_property(name, json!(value));
        item.sequence_number = seq;
        item
    }

    fn release_all(state: &mut ReadState) {
        release(state, i64::MAX);
    }

    fn state() -> ReadState {
        ReadState {
            aggregator: SnapshotManager::new(0, 0, 0),
            ready: VecDeque::new(),
            running: None,
            highest_fed: 0,
            generation: 0,
        }
    }

    #[test]
    fn test_windowed_feed_merges_with_stats() {
        let mut st = state();
        {
            let mut table = st.aggregator.lock();
            table.update_intervals(1_000, 0, 1_000, 0);
            feed_item(&mut table, delta(1, 5_100, "Temp", 10), 1_000, true, 0);
            feed_item(&mut table, delta(2, 5_500, "Temp", 20), 1_000, true, 0);
            feed_item(&mut table, delta(3, 6_100, "Temp", 30), 1_000, true, 0);
        }
        release_all(&mut st);

        let mut out = Vec::new();
        let params = HistoryParameters::new().with_aggregates(AggregateFlags::ALL);
        let highest = deliver(&mut st, &params, None, &mut out);

        assert_eq!(highest, Some(3));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].sequence_number, 2);
        assert_eq!(out[0].get("Temp"), Some(&json!(20)));
        assert_eq!(out[0].get("Temp.[N]"), Some(&json!(2)));
        assert_eq!(out[0].get("Temp.[Avg]").and_then(|v| v.as_f64()), Some(15.0));
        assert_eq!(out[1].get("Temp.[N]"), Some(&json!(1)));
    }

    #[test]
    fn test_zero_window_feed_never_merges() {
        let mut st = state();
        {
            let mut table = st.aggregator.lock();
            feed_item(&mut table, delta(1, 5_000, "Temp", 10), 0, false, 0);
            feed_item(&mut table, delta(2, 5_000, "Temp", 12), 0, false, 0);
        }
        release_all(&mut st);

        let mut out = Vec::new();
        deliver(&mut st, &HistoryParameters::new(), None, &mut out);
        let values: Vec<_> = out.iter().map(|i| i.get("Temp").cloned()).collect();
        assert_eq!(values, vec![Some(json!(10)), Some(json!(12))]);
        assert!(out.iter().all(|i| !i.properties.contains_key("Temp.[N]")));
    }

    #[test]
    fn test_deliver_respects_room_and_keeps_rest_ready() {
        let mut st = state();
        for seq in 1..=3 {
            st.ready
                .push_back((delta(seq, seq as i64, "Temp", seq as i64), SequenceSpan::single(seq)));
        }

        let mut out = Vec::new();
        let highest = deliver(&mut st, &HistoryParameters::new(), Some(2), &mut out);
        assert_eq!(highest, Some(2));
        assert_eq!(st.ready.len(), 1);
    }

    #[test]
    fn test_deliver_full_state() {
        let mut st = state();
        st.ready
            .push_back((delta(5, 500, "B", 9), SequenceSpan::single(5)));

        let mut running = PropertyMap::new();
        running.insert("A".to_string(), json!(1));
        running.insert("B".to_string(), json!(2));
        running.insert("Hidden".to_string(), json!(0));
        st.running = Some(running);

        let params = HistoryParameters::new().full_state().excluding(["Hidden"]);
        let mut out = Vec::new();
        deliver(&mut st, &params, None, &mut out);

        let item = &out[0];
        assert!(item.is_full_snapshot);
        assert_eq!(item.properties.len(), 2);
        assert_eq!(item.get("A"), Some(&json!(1)));
        assert_eq!(item.get("B"), Some(&json!(9)));
        assert_eq!(st.running.as_ref().unwrap()["B"], json!(9));
    }

    #[test]
    fn test_late_arrival_keeps_sequence_order_across_drains() {
        let mut st = state();
        {
            let mut table = st.aggregator.lock();
            table.update_intervals(1_000, 0, 1_000, 0);
            feed_item(&mut table, delta(1, 5_000, "Temp", 10), 1_000, false, 0);
            feed_item(&mut table, delta(2, 15_000, "Temp", 20), 1_000, false, 1_500);
            // Late record for the older window, still open
            feed_item(&mut table, delta(3, 5_500, "Temp", 11), 1_000, false, 1_500);
        }

        let params = HistoryParameters::new();
        let mut out = Vec::new();

        // The older window is final but carries seq 3 while seq 2 is still open.
        release(&mut st, 1_000);
        assert_eq!(deliver(&mut st, &params, None, &mut out), None);
        assert!(out.is_empty());
        assert_eq!(st.pending_count(), 2);

        release(&mut st, 2_000);
        let cursor = deliver(&mut st, &params, Some(1), &mut out);
        // Seq 1 is folded into the item still waiting, so the cursor stays put.
        assert_eq!(cursor, Some(0));

        let cursor = deliver(&mut st, &params, None, &mut out);
        assert_eq!(cursor, Some(3));
        let seqs: Vec<u64> = out.iter().map(|item| item.sequence_number).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(out[1].get("Temp"), Some(&json!(11)));
    }

    fn historian() -> Arc<Historian> {
        Historian::new(HistorianConfig::default()).unwrap()
    }

    #[test]
    fn test_base_state_without_baseline_uses_first_record() {
        let h = historian();
        let thing = h.thing("pump").unwrap();
        assert_eq!(base_state(&thing, 0), (PropertyMap::new(), false));

        thing.stream.add_item(delta(0, 100, "A", 1)).unwrap();
        thing.stream.add_item(delta(0, 200, "B", 2)).unwrap();
        thing.stream.add_item(delta(0, 300, "A", 5)).unwrap();

        let (state, data_loss) = base_state(&thing, 2);
        assert!(data_loss);
        assert_eq!(state.len(), 2);
        assert_eq!(state["A"], json!(1));
        assert_eq!(state["B"], json!(2));
    }

    #[test]
    fn test_tombstone_inside_scan_is_data_loss() {
        let h = historian();
        let token = h.register_consumer("pump", HistoryParameters::new(), None).unwrap();
        let consumer = h.consumer(&token).unwrap();
        let thing = h.existing_thing("pump").unwrap();

        let baseline = ThingSnapshot::full("pump", 100, PropertyMap::new())
            .with_property("A", json!(0))
            .with_expiration(Expiration::Pinned);
        thing.stream.add_item(baseline).unwrap();
        thing.stream.add_item(delta(0, 200, "A", 1)).unwrap();
        thing.stream.add_item(delta(0, 300, "A", 2)).unwrap();
        // Compaction keeps the baseline, leaving a hole behind it
        assert_eq!(thing.stream.delete_items_up_to(2), 1);

        let params = HistoryParameters::new();
        let mut st = ReadState::new(&consumer.registration.lock());
        assert!(feed(&consumer, &thing, &params, &mut st, 0));
        assert_eq!(st.highest_fed, 3);
        assert_eq!(st.pending_count(), 1);

        thing.stream.add_item(delta(0, 400, "A", 3)).unwrap();
        assert!(!feed(&consumer, &thing, &params, &mut st, 0));
        assert_eq!(st.pending_count(), 2);
    }
}
