//! Snapshot records stored in the sequence stream
//!
//! A snapshot is a point-in-time, possibly partial capture of a thing's
//! properties. Full snapshots carry every tracked property; deltas carry only
//! what changed and are read relative to the latest full snapshot at or
//! before their sequence number.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Property path → value
pub type PropertyMap = HashMap<String, Value>;

/// Retention marker of a stored snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Expiration {
    /// Governed by the stream's age/size retention
    #[default]
    Normal,
    /// Never expires or compacts
    Pinned,
    /// Pinned, and skipped by consumers that only want deltas
    PinnedIgnore,
}

impl Expiration {
    /// Whether the record survives retention
    pub fn is_pinned(self) -> bool {
        !matches!(self, Expiration::Normal)
    }
}

/// A recorded state capture (full or delta) of one thing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThingSnapshot {
    /// Assigned by the stream on append (0 until then)
    #[serde(rename = "seq", default)]
    pub sequence_number: u64,

    /// Unix milliseconds
    #[serde(rename = "ts")]
    pub timestamp: i64,

    #[serde(rename = "thing")]
    pub thing_id: String,

    #[serde(rename = "props", default)]
    pub properties: PropertyMap,

    #[serde(rename = "full", default, skip_serializing_if = "is_false")]
    pub is_full_snapshot: bool,

    #[serde(rename = "initial", default, skip_serializing_if = "is_false")]
    pub is_initial_value: bool,

    #[serde(rename = "exp", default, skip_serializing_if = "is_normal")]
    pub expiration: Expiration,
}

fn is_false(val: &bool) -> bool {
    !*val
}

fn is_normal(exp: &Expiration) -> bool {
    *exp == Expiration::Normal
}

impl ThingSnapshot {
    /// Create a delta snapshot holding only the given properties
    pub fn delta(thing_id: impl Into<String>, timestamp: i64, properties: PropertyMap) -> Self {
        Self {
            sequence_number: 0,
            timestamp,
            thing_id: thing_id.into(),
            properties,
            is_full_snapshot: false,
            is_initial_value: false,
            expiration: Expiration::Normal,
        }
    }

    /// Create a full snapshot of the given property state
    pub fn full(thing_id: impl Into<String>, timestamp: i64, properties: PropertyMap) -> Self {
        Self {
            is_full_snapshot: true,
            ..Self::delta(thing_id, timestamp, properties)
        }
    }

    /// Add or replace a single property
    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Mark as an initial-value capture
    pub fn as_initial_value(mut self) -> Self {
        self.is_initial_value = true;
        self
    }

    /// Set the retention marker
    pub fn with_expiration(mut self, expiration: Expiration) -> Self {
        self.expiration = expiration;
        self
    }

    /// A pinned full snapshot usable as reconstruction baseline
    pub fn is_baseline(&self) -> bool {
        self.is_full_snapshot && self.expiration.is_pinned()
    }

    /// Get a property value
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Fold this snapshot into a running property state
    ///
    /// Full snapshots replace the state; deltas overwrite what they carry.
    pub fn apply_to(&self, state: &mut PropertyMap) {
        if self.is_full_snapshot {
            state.clone_from(&self.properties);
        } else {
            for (name, value) in &self.properties {
                state.insert(name.clone(), value.clone());
            }
        }
    }

    /// Reconstruct the full state this snapshot represents on top of `baseline`
    pub fn clone_for_thing_snapshot(&self, baseline: &PropertyMap) -> ThingSnapshot {
        let mut state = baseline.clone();
        self.apply_to(&mut state);
        ThingSnapshot {
            properties: state,
            is_full_snapshot: true,
            ..self.clone()
        }
    }
}
