//! Persisted table of durable consumer registrations

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::HistorianResult;
use crate::types::{ConsumerRegistration, ConsumerToken};
use crate::utils::atomic::{read_jsonl, write_jsonl};

/// Registrations flagged `persistent`, one JSON line each
///
/// Every change rewrites the file atomically; the table is small.
pub struct RegistrationStore {
    path: Option<PathBuf>,
    records: Mutex<HashMap<ConsumerToken, ConsumerRegistration>>,
}

impl RegistrationStore {
    /// Memory-only table
    pub fn new() -> Self {
        Self {
            path: None,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Open the table at `path`, loading existing registrations
    pub fn open(path: Option<PathBuf>) -> HistorianResult<Self> {
        let mut records = HashMap::new();
        if let Some(path) = &path {
            let loaded: Vec<ConsumerRegistration> = read_jsonl(path)?;
            debug!(path = %path.display(), count = loaded.len(), "Loaded consumer registrations");
            for registration in loaded {
                records.insert(registration.token, registration);
            }
        }
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Snapshot of every stored registration
    pub fn load_all(&self) -> Vec<ConsumerRegistration> {
        self.records.lock().values().cloned().collect()
    }

    /// Store the current state of a registration
    ///
    /// Non-persistent registrations are dropped from the table instead.
    pub fn upsert(&self, registration: &ConsumerRegistration) -> HistorianResult<()> {
        {
            let mut records = self.records.lock();
            if registration.parameters.persistent {
                records.insert(registration.token, registration.clone());
            } else if records.remove(&registration.token).is_none() {
                return Ok(());
            }
        }
        self.save()
    }

    /// Forget a registration; returns whether it was stored
    pub fn remove(&self, token: &ConsumerToken) -> HistorianResult<bool> {
        let removed = self.records.lock().remove(token).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Write the table (no-op for memory-only tables)
    pub fn save(&self) -> HistorianResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut rows = self.load_all();
        rows.sort_by_key(|r| r.token);
        write_jsonl(path, &rows)
    }
}

impl Default for RegistrationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HistoryParameters;
    use tempfile::TempDir;

    fn registration(persistent: bool) -> ConsumerRegistration {
        let params = if persistent {
            HistoryParameters::new().persistent()
        } else {
            HistoryParameters::new()
        };
        ConsumerRegistration::new(ConsumerToken::new(), "pump", params, 0, 0)
    }

    #[test]
    fn test_only_persistent_registrations_are_kept() {
        let store = RegistrationStore::new();
        store.upsert(&registration(false)).unwrap();
        assert!(store.is_empty());

        let durable = registration(true);
        store.upsert(&durable).unwrap();
        assert_eq!(store.len(), 1);

        assert!(store.remove(&durable.token).unwrap());
        assert!(!store.remove(&durable.token).unwrap());
    }

    #[test]
    fn test_reload_restores_cursor() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("registrations.jsonl");

        let mut durable = registration(true);
        {
            let store = RegistrationStore::open(Some(path.clone())).unwrap();
            durable.advance_read(12);
            durable.clear();
            store.upsert(&durable).unwrap();
        }

        let store = RegistrationStore::open(Some(path)).unwrap();
        let loaded = store.load_all();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].token, durable.token);
        assert_eq!(loaded[0].sequence_number_truncated, 12);
    }
}
