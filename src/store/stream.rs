//! In-memory sequence stream with optional JSONL persistence

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::SequenceStream;
use crate::error::{HistorianError, HistorianResult};
use crate::types::{Expiration, ThingSnapshot};
use crate::utils::atomic::{read_jsonl, write_jsonl};
use crate::utils::time::{duration_ms, now_millis};

/// One line of a persisted stream file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum StreamLine {
    Header { first_seq: u64, next_seq: u64 },
    Item(ThingSnapshot),
}

#[derive(Debug)]
struct StreamInner {
    items: VecDeque<Option<ThingSnapshot>>,
    /// Sequence number of `items[0]` (equals `next_seq` when empty)
    first_seq: u64,
    next_seq: u64,
    baseline_seq: u64,
    live: usize,
    max_items: Option<usize>,
    max_age: Option<i64>,
}

impl StreamInner {
    fn empty() -> Self {
        Self {
            items: VecDeque::new(),
            first_seq: 1,
            next_seq: 1,
            baseline_seq: 0,
            live: 0,
            max_items: None,
            max_age: None,
        }
    }

    fn index_of(&self, sequence: u64) -> Option<usize> {
        if sequence < self.first_seq || sequence >= self.next_seq {
            None
        } else {
            Some((sequence - self.first_seq) as usize)
        }
    }

    fn get_mut(&mut self, sequence: u64) -> Option<&mut ThingSnapshot> {
        let idx = self.index_of(sequence)?;
        self.items.get_mut(idx).and_then(Option::as_mut)
    }

    fn unpin(&mut self, sequence: u64) {
        if let Some(old) = self.get_mut(sequence) {
            old.expiration = Expiration::Normal;
        }
    }

    fn trim_front(&mut self) {
        while let Some(None) = self.items.front() {
            self.items.pop_front();
            self.first_seq += 1;
        }
        if self.items.is_empty() {
            self.first_seq = self.next_seq;
        }
    }

    /// Tombstone the oldest non-baseline records past the size/age limits
    fn enforce_retention(&mut self, now: i64) -> usize {
        if self.max_items.is_none() && self.max_age.is_none() {
            return 0;
        }

        let mut evicted = 0;
        loop {
            let baseline = self.baseline_seq;
            let Some(idx) = self
                .items
                .iter()
                .position(|e| matches!(e, Some(s) if s.sequence_number != baseline))
            else {
                break;
            };

            let over_count = self.max_items.map_or(false, |max| self.live > max);
            let over_age = match (self.max_age, &self.items[idx]) {
                (Some(age), Some(item)) => item.timestamp < now.saturating_sub(age),
                _ => false,
            };
            if !(over_count || over_age) {
                break;
            }

            self.items[idx] = None;
            self.live -= 1;
            evicted += 1;
        }

        self.trim_front();
        evicted
    }
}

/// `SequenceStream` held in memory and saved as one JSONL file
///
/// The file starts with a header line recording the sequence range so
/// numbering keeps going after a restart even when everything was compacted.
pub struct MemorySequenceStream {
    thing_id: String,
    path: Option<PathBuf>,
    inner: RwLock<StreamInner>,
    dirty: AtomicBool,
    signal: watch::Sender<u64>,
}

impl MemorySequenceStream {
    /// Create an empty, memory-only stream
    pub fn new(thing_id: impl Into<String>) -> Self {
        let (signal, _) = watch::channel(0);
        Self {
            thing_id: thing_id.into(),
            path: None,
            inner: RwLock::new(StreamInner::empty()),
            dirty: AtomicBool::new(false),
            signal,
        }
    }

    /// Open a stream persisted at `path`, loading what is already there
    pub fn open(thing_id: impl Into<String>, path: Option<PathBuf>) -> HistorianResult<Self> {
        let mut stream = Self::new(thing_id);
        if let Some(path) = path {
            let inner = Self::load(&stream.thing_id, &path)?;
            debug!(
                thing = %stream.thing_id,
                records = inner.live,
                next_seq = inner.next_seq,
                "Loaded sequence stream"
            );
            stream.signal.send_replace(inner.next_seq - 1);
            stream.inner = RwLock::new(inner);
            stream.path = Some(path);
        }
        Ok(stream)
    }

    fn load(thing_id: &str, path: &PathBuf) -> HistorianResult<StreamInner> {
        let lines: Vec<StreamLine> = read_jsonl(path)?;

        let mut next_seq = 1;
        let mut records = Vec::new();
        for line in lines {
            match line {
                StreamLine::Header { next_seq: n, .. } => next_seq = next_seq.max(n),
                StreamLine::Item(item) if item.sequence_number == 0 => {
                    warn!(path = %path.display(), "Skipping record without sequence number");
                }
                StreamLine::Item(item) if item.thing_id != thing_id => {
                    warn!(
                        path = %path.display(),
                        expected = thing_id,
                        found = %item.thing_id,
                        "Skipping record of another thing"
                    );
                }
                StreamLine::Item(item) => records.push(item),
            }
        }
        records.sort_by_key(|r| r.sequence_number);
        records.dedup_by_key(|r| r.sequence_number);

        let mut inner = StreamInner::empty();
        if let Some(last) = records.last() {
            next_seq = next_seq.max(last.sequence_number + 1);
        }
        inner.next_seq = next_seq;
        inner.first_seq = records
            .first()
            .map(|r| r.sequence_number)
            .unwrap_or(next_seq);

        for record in records {
            while inner.first_seq + (inner.items.len() as u64) < record.sequence_number {
                inner.items.push_back(None);
            }
            if record.is_baseline() {
                inner.baseline_seq = record.sequence_number;
            }
            inner.items.push_back(Some(record));
            inner.live += 1;
        }

        Ok(inner)
    }
}

impl SequenceStream for MemorySequenceStream {
    fn add_item(&self, mut item: ThingSnapshot) -> HistorianResult<u64> {
        let sequence = {
            let mut guard = self.inner.write();
            let inner = &mut *guard;

            let sequence = inner.next_seq;
            item.sequence_number = sequence;
            if item.is_baseline() {
                let old = inner.baseline_seq;
                if old != 0 {
                    inner.unpin(old);
                }
                inner.baseline_seq = sequence;
            }

            inner.items.push_back(Some(item));
            inner.next_seq += 1;
            inner.live += 1;

            let evicted = inner.enforce_retention(now_millis());
            if evicted > 0 {
                debug!(thing = %self.thing_id, evicted, "Evicted records past retention");
            }
            sequence
        };

        self.dirty.store(true, Ordering::Release);
        self.signal.send_replace(sequence);
        Ok(sequence)
    }

    fn get_items(&self, from: u64) -> (Vec<Option<ThingSnapshot>>, u64) {
        let inner = self.inner.read();
        let start = from.max(inner.first_seq);
        match inner.index_of(start) {
            Some(idx) => (inner.items.range(idx..).cloned().collect(), start),
            None => (Vec::new(), start),
        }
    }

    fn first_sequence_number(&self) -> u64 {
        let inner = self.inner.read();
        if inner.items.is_empty() {
            0
        } else {
            inner.first_seq
        }
    }

    fn last_sequence_number(&self) -> u64 {
        self.inner.read().next_seq - 1
    }

    fn offset_by_timestamp(&self, timestamp: i64) -> u64 {
        let inner = self.inner.read();
        inner
            .items
            .iter()
            .flatten()
            .find(|item| item.timestamp >= timestamp)
            .map(|item| item.sequence_number)
            .unwrap_or(inner.next_seq)
    }

    fn find_last_item_at_or_before(
        &self,
        sequence: u64,
        predicate: &dyn Fn(&ThingSnapshot) -> bool,
    ) -> Option<ThingSnapshot> {
        let inner = self.inner.read();
        if inner.items.is_empty() || sequence < inner.first_seq {
            return None;
        }
        let end = (sequence.min(inner.next_seq - 1) - inner.first_seq) as usize;
        inner
            .items
            .range(..=end)
            .rev()
            .flatten()
            .find(|item| predicate(item))
            .cloned()
    }

    fn baseline_sequence_number(&self) -> u64 {
        self.inner.read().baseline_seq
    }

    fn set_baseline(&self, sequence: u64, mut baseline: ThingSnapshot) -> HistorianResult<()> {
        {
            let mut guard = self.inner.write();
            let inner = &mut *guard;

            if inner.get_mut(sequence).is_none() {
                return Err(HistorianError::SequenceNotFound(sequence));
            }

            baseline.sequence_number = sequence;
            baseline.is_full_snapshot = true;
            baseline.is_initial_value = false;
            baseline.expiration = Expiration::Pinned;

            let old = inner.baseline_seq;
            if old != 0 && old != sequence {
                inner.unpin(old);
            }
            if let Some(slot) = inner.get_mut(sequence) {
                *slot = baseline;
            }
            inner.baseline_seq = sequence;
        }

        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn pin_baseline(&self, sequence: u64, expiration: Expiration) -> HistorianResult<()> {
        {
            let mut guard = self.inner.write();
            let inner = &mut *guard;

            let item = inner
                .get_mut(sequence)
                .filter(|item| item.is_full_snapshot)
                .ok_or(HistorianError::SequenceNotFound(sequence))?;
            item.expiration = expiration;

            if expiration.is_pinned() {
                let old = inner.baseline_seq;
                if old != 0 && old != sequence {
                    inner.unpin(old);
                }
                inner.baseline_seq = sequence;
            } else if inner.baseline_seq == sequence {
                inner.baseline_seq = 0;
            }
        }

        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn delete_items_up_to(&self, sequence: u64) -> usize {
        let guard = self.inner.upgradable_read();
        if guard.items.is_empty() || sequence < guard.first_seq {
            return 0;
        }

        let mut inner = RwLockUpgradableReadGuard::upgrade(guard);
        let end = sequence.min(inner.next_seq - 1);
        let baseline = inner.baseline_seq;
        let mut removed = 0;

        for seq in inner.first_seq..=end {
            if seq == baseline {
                continue;
            }
            let idx = (seq - inner.first_seq) as usize;
            if inner.items[idx].take().is_some() {
                removed += 1;
            }
        }
        inner.live -= removed;
        inner.trim_front();
        drop(inner);

        if removed > 0 {
            self.dirty.store(true, Ordering::Release);
            debug!(thing = %self.thing_id, up_to = sequence, removed, "Compacted stream");
        }
        removed
    }

    fn skip_past(&self, sequence: u64) -> bool {
        {
            let mut guard = self.inner.write();
            let inner = &mut *guard;
            if sequence < inner.next_seq {
                return false;
            }

            if inner.items.is_empty() {
                inner.first_seq = sequence + 1;
            } else {
                let gap = sequence + 1 - inner.next_seq;
                inner.items.extend((0..gap).map(|_| None));
            }
            inner.next_seq = sequence + 1;
        }

        self.dirty.store(true, Ordering::Release);
        self.signal.send_replace(sequence);
        warn!(thing = %self.thing_id, next_seq = sequence + 1, "Skipped sequence numbers missing from the stream");
        true
    }

    fn set_retention(&self, max_items: Option<usize>, max_age: Option<Duration>) {
        let mut inner = self.inner.write();
        inner.max_items = max_items;
        inner.max_age = max_age.map(duration_ms);
        if inner.enforce_retention(now_millis()) > 0 {
            self.dirty.store(true, Ordering::Release);
        }
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.signal.subscribe()
    }

    fn len(&self) -> usize {
        self.inner.read().live
    }

    fn save(&self) -> HistorianResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let lines: Vec<StreamLine> = {
            let inner = self.inner.read();
            std::iter::once(StreamLine::Header {
                first_seq: inner.first_seq,
                next_seq: inner.next_seq,
            })
            .chain(inner.items.iter().flatten().cloned().map(StreamLine::Item))
            .collect()
        };

        if let Err(e) = write_jsonl(path, &lines) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self) -> HistorianResult<()> {
        {
            let mut inner = self.inner.write();
            inner.items.clear();
            inner.live = 0;
            inner.baseline_seq = 0;
            inner.first_seq = inner.next_seq;
        }
        self.dirty.store(false, Ordering::Release);

        if let Some(path) = &self.path {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PropertyMap;
    use serde_json::json;
    use tempfile::TempDir;

    fn delta(ts: i64, value: i64) -> ThingSnapshot {
        ThingSnapshot::delta("pump", ts, PropertyMap::new()).with_property("Temp", json!(value))
    }

    fn baseline(ts: i64) -> ThingSnapshot {
        ThingSnapshot::full("pump", ts, PropertyMap::new())
            .with_property("Temp", json!(0))
            .with_expiration(Expiration::Pinned)
    }

    #[test]
    fn test_sequence_numbers_start_at_one() {
        let stream = MemorySequenceStream::new("pump");
        assert_eq!(stream.last_sequence_number(), 0);
        assert_eq!(stream.first_sequence_number(), 0);

        assert_eq!(stream.add_item(delta(10, 1)).unwrap(), 1);
        assert_eq!(stream.add_item(delta(20, 2)).unwrap(), 2);
        assert_eq!(stream.first_sequence_number(), 1);
        assert_eq!(stream.last_sequence_number(), 2);

        let (items, first) = stream.get_items(1);
        assert_eq!(first, 1);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].as_ref().unwrap().sequence_number, 2);
    }

    #[test]
    fn test_get_items_reports_compacted_start() {
        let stream = MemorySequenceStream::new("pump");
        for i in 0..5 {
            stream.add_item(delta(i, i)).unwrap();
        }
        assert_eq!(stream.delete_items_up_to(3), 3);

        let (items, first) = stream.get_items(2);
        assert_eq!(first, 4);
        assert_eq!(items.len(), 2);

        let (items, first) = stream.get_items(9);
        assert!(items.is_empty());
        assert_eq!(first, 9);
    }

    #[test]
    fn test_delete_keeps_baseline() {
        let stream = MemorySequenceStream::new("pump");
        stream.add_item(delta(1, 1)).unwrap();
        stream.add_item(baseline(2)).unwrap();
        for i in 3..=6 {
            stream.add_item(delta(i, i)).unwrap();
        }
        assert_eq!(stream.baseline_sequence_number(), 2);

        stream.delete_items_up_to(4);
        assert_eq!(stream.first_sequence_number(), 2);
        assert_eq!(stream.len(), 3);

        let (items, first) = stream.get_items(0);
        assert_eq!(first, 2);
        assert!(items[0].as_ref().unwrap().is_baseline());
        assert!(items[1].is_none());
        assert!(items[2].is_none());
        assert_eq!(items[3].as_ref().unwrap().sequence_number, 5);
    }

    #[test]
    fn test_set_baseline_moves_designation() {
        let stream = MemorySequenceStream::new("pump");
        stream.add_item(baseline(1)).unwrap();
        stream.add_item(delta(2, 5)).unwrap();
        stream.add_item(delta(3, 6)).unwrap();

        let merged = ThingSnapshot::full("pump", 3, PropertyMap::new()).with_property("Temp", json!(6));
        stream.set_baseline(3, merged).unwrap();
        assert_eq!(stream.baseline_sequence_number(), 3);

        let found = stream
            .find_last_item_at_or_before(3, &|s| s.is_baseline())
            .unwrap();
        assert_eq!(found.sequence_number, 3);
        assert!(stream
            .find_last_item_at_or_before(2, &|s| s.is_baseline())
            .is_none());

        assert!(matches!(
            stream.set_baseline(42, baseline(0)),
            Err(HistorianError::SequenceNotFound(42))
        ));
    }

    #[test]
    fn test_pin_baseline() {
        let stream = MemorySequenceStream::new("pump");
        stream
            .add_item(ThingSnapshot::full("pump", 1, PropertyMap::new()))
            .unwrap();
        stream.add_item(delta(2, 1)).unwrap();
        assert_eq!(stream.baseline_sequence_number(), 0);

        stream.pin_baseline(1, Expiration::PinnedIgnore).unwrap();
        assert_eq!(stream.baseline_sequence_number(), 1);
        assert!(stream.pin_baseline(2, Expiration::Pinned).is_err());

        stream.pin_baseline(1, Expiration::Normal).unwrap();
        assert_eq!(stream.baseline_sequence_number(), 0);
    }

    #[test]
    fn test_retention_never_evicts_baseline() {
        let stream = MemorySequenceStream::new("pump");
        stream.add_item(baseline(now_millis())).unwrap();
        stream.set_retention(Some(2), None);
        for i in 0..5 {
            stream.add_item(delta(now_millis(), i)).unwrap();
        }

        assert_eq!(stream.len(), 2);
        assert_eq!(stream.baseline_sequence_number(), 1);
        let (items, first) = stream.get_items(0);
        assert_eq!(first, 1);
        assert_eq!(items.last().unwrap().as_ref().unwrap().sequence_number, 6);
    }

    #[test]
    fn test_offset_by_timestamp() {
        let stream = MemorySequenceStream::new("pump");
        stream.add_item(delta(100, 1)).unwrap();
        stream.add_item(delta(200, 2)).unwrap();
        stream.add_item(delta(300, 3)).unwrap();

        assert_eq!(stream.offset_by_timestamp(0), 1);
        assert_eq!(stream.offset_by_timestamp(150), 2);
        assert_eq!(stream.offset_by_timestamp(300), 3);
        assert_eq!(stream.offset_by_timestamp(301), 4);
    }

    #[test]
    fn test_signal_carries_last_sequence() {
        let stream = MemorySequenceStream::new("pump");
        let mut rx = stream.subscribe();
        assert_eq!(*rx.borrow_and_update(), 0);

        stream.add_item(delta(1, 1)).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    #[test]
    fn test_persistence_keeps_numbering() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("streams").join("pump.jsonl");

        {
            let stream = MemorySequenceStream::open("pump", Some(path.clone())).unwrap();
            stream.add_item(baseline(1)).unwrap();
            for i in 2..=5 {
                stream.add_item(delta(i, i)).unwrap();
            }
            stream.delete_items_up_to(3);
            stream.save().unwrap();
        }

        let stream = MemorySequenceStream::open("pump", Some(path.clone())).unwrap();
        assert_eq!(stream.len(), 3);
        assert_eq!(stream.baseline_sequence_number(), 1);
        assert_eq!(stream.last_sequence_number(), 5);
        assert_eq!(stream.add_item(delta(6, 6)).unwrap(), 6);

        let (items, _) = stream.get_items(0);
        assert!(items[1].is_none());

        stream.remove().unwrap();
        assert!(!path.exists());
        assert!(stream.is_empty());
    }

    #[test]
    fn test_load_skips_records_of_other_things() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("pump.jsonl");
        {
            let stream = MemorySequenceStream::open("valve", Some(path.clone())).unwrap();
            let mut item = delta(1, 1);
            item.thing_id = "valve".to_string();
            stream.add_item(item).unwrap();
            stream.save().unwrap();
        }

        let stream = MemorySequenceStream::open("pump", Some(path)).unwrap();
        assert!(stream.is_empty());
        // Numbering still continues past what the file recorded.
        assert_eq!(stream.last_sequence_number(), 1);
    }

    #[test]
    fn test_skip_past_leaves_tombstones() {
        let stream = MemorySequenceStream::new("pump");
        stream.add_item(delta(1, 1)).unwrap();

        assert!(stream.skip_past(3));
        assert!(!stream.skip_past(2));
        assert_eq!(stream.last_sequence_number(), 3);
        assert_eq!(stream.add_item(delta(4, 4)).unwrap(), 4);

        let (items, first) = stream.get_items(2);
        assert_eq!(first, 2);
        assert!(items[0].is_none());
        assert!(items[1].is_none());
        assert_eq!(items[2].as_ref().unwrap().sequence_number, 4);

        let empty = MemorySequenceStream::new("valve");
        assert!(empty.skip_past(5));
        assert_eq!(empty.first_sequence_number(), 0);
        assert_eq!(empty.add_item(delta(6, 6)).unwrap(), 6);
        assert_eq!(empty.first_sequence_number(), 6);
    }
}
