//! Running statistics for aggregated properties
//!
//! Each aggregated numeric property `p` carries sibling pseudo-properties
//! `p.[Avg]`, `p.[Min]`, `p.[Max]` and `p.[N]` on the snapshot. Merging two
//! captures combines them:
//!
//! ```text
//! n'   = n1 + n2
//! avg' = (avg1·n1 + avg2·n2) / n'
//! min' = min(min1, min2)
//! max' = max(max1, max2)
//! ```
//!
//! A raw value without pseudo-properties counts as a single sample.
//! Non-aggregated properties are last-write-wins.

use serde_json::Value;

use crate::types::{AggregateFlags, PropertyMap, ThingSnapshot};

pub const AVG_SUFFIX: &str = ".[Avg]";
pub const MIN_SUFFIX: &str = ".[Min]";
pub const MAX_SUFFIX: &str = ".[Max]";
pub const N_SUFFIX: &str = ".[N]";

const SUFFIXES: [&str; 4] = [AVG_SUFFIX, MIN_SUFFIX, MAX_SUFFIX, N_SUFFIX];

/// Whether `path` is one of the statistics pseudo-properties
pub fn is_aggregate_property(path: &str) -> bool {
    SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
}

/// The property a pseudo-property belongs to (`path` itself otherwise)
pub fn base_property(path: &str) -> &str {
    SUFFIXES
        .iter()
        .find_map(|suffix| path.strip_suffix(suffix))
        .unwrap_or(path)
}

fn stat_name(base: &str, suffix: &str) -> String {
    format!("{}{}", base, suffix)
}

/// `{avg, min, max, n}` of one property
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropertyStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub n: u64,
}

impl PropertyStats {
    /// Statistics of a single sample
    pub fn single(value: f64) -> Self {
        Self {
            avg: value,
            min: value,
            max: value,
            n: 1,
        }
    }

    /// Combine two sets of statistics
    pub fn combine(&self, other: &PropertyStats) -> PropertyStats {
        let n = self.n + other.n;
        let avg = if n == 0 {
            0.0
        } else {
            (self.avg * self.n as f64 + other.avg * other.n as f64) / n as f64
        };
        PropertyStats {
            avg,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            n,
        }
    }

    /// Read the statistics of `base` from a property map
    ///
    /// Falls back to the raw value as a single sample when no `[N]` is stored.
    /// Returns `None` for missing or non-numeric properties.
    pub fn read(props: &PropertyMap, base: &str) -> Option<PropertyStats> {
        let raw = props.get(base).and_then(Value::as_f64);
        let n = props
            .get(&stat_name(base, N_SUFFIX))
            .and_then(Value::as_u64)
            .filter(|n| *n > 0);

        let Some(n) = n else {
            return raw.map(PropertyStats::single);
        };

        let get = |suffix: &str| props.get(&stat_name(base, suffix)).and_then(Value::as_f64);
        let avg = get(AVG_SUFFIX).or(raw)?;
        Some(PropertyStats {
            avg,
            min: get(MIN_SUFFIX).unwrap_or(avg),
            max: get(MAX_SUFFIX).unwrap_or(avg),
            n,
        })
    }

    /// Store as pseudo-properties of `base`
    pub fn write(&self, props: &mut PropertyMap, base: &str) {
        props.insert(stat_name(base, AVG_SUFFIX), Value::from(self.avg));
        props.insert(stat_name(base, MIN_SUFFIX), Value::from(self.min));
        props.insert(stat_name(base, MAX_SUFFIX), Value::from(self.max));
        props.insert(stat_name(base, N_SUFFIX), Value::from(self.n));
    }
}

/// Merge one property update into a snapshot's property map
pub fn merge_value(props: &mut PropertyMap, name: &str, value: Value, aggregate: bool) {
    if aggregate {
        if let Some(sample) = value.as_f64() {
            let incoming = PropertyStats::single(sample);
            let merged = match PropertyStats::read(props, name) {
                Some(existing) => existing.combine(&incoming),
                None => incoming,
            };
            merged.write(props, name);
        }
    }
    props.insert(name.to_string(), value);
}

/// Merge `incoming` into `target` as a later capture of the same window
///
/// Properties are unioned; a full incoming snapshot makes the result full.
/// The timestamp advances to the latest seen.
pub fn merge_snapshot(target: &mut ThingSnapshot, incoming: &ThingSnapshot, aggregate: bool) {
    for (name, value) in &incoming.properties {
        if is_aggregate_property(name) {
            continue;
        }
        if aggregate {
            if let Some(inc) = PropertyStats::read(&incoming.properties, name) {
                let merged = match PropertyStats::read(&target.properties, name) {
                    Some(existing) => existing.combine(&inc),
                    None => inc,
                };
                merged.write(&mut target.properties, name);
            }
        }
        target.properties.insert(name.clone(), value.clone());
    }

    target.timestamp = target.timestamp.max(incoming.timestamp);
    target.is_full_snapshot |= incoming.is_full_snapshot;
    target.is_initial_value |= incoming.is_initial_value;
}

/// Shape the statistics of a delivered snapshot to what a consumer asked for
///
/// Numeric properties without stored statistics get single-sample ones; pseudo-
/// properties the consumer didn't request are dropped.
pub fn retain_requested(props: &mut PropertyMap, flags: AggregateFlags) {
    if flags.any() {
        let missing: Vec<(String, f64)> = props
            .iter()
            .filter(|(name, _)| !is_aggregate_property(name))
            .filter(|(name, _)| !props.contains_key(&stat_name(name, N_SUFFIX)))
            .filter_map(|(name, value)| value.as_f64().map(|v| (name.clone(), v)))
            .collect();
        for (name, value) in missing {
            PropertyStats::single(value).write(props, &name);
        }
    }

    props.retain(|name, _| {
        if name.ends_with(AVG_SUFFIX) {
            flags.avg
        } else if name.ends_with(MIN_SUFFIX) {
            flags.min
        } else if name.ends_with(MAX_SUFFIX) {
            flags.max
        } else if name.ends_with(N_SUFFIX) {
            flags.n
        } else {
            true
        }
    });
}
