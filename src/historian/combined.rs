//! Union policy of every consumer of one thing
//!
//! The combined registration drives global ingestion, so it must be at
//! least as fine-grained and as permissive as each consumer: the tightest
//! window, the shortest cooldown, every property somebody wants, and the
//! longest retention anybody needs.

use std::collections::HashSet;
use std::time::Duration;

use crate::aggregation::stats::base_property;
use crate::types::{AggregateFlags, HistoryParameters};

#[derive(Debug, Clone, PartialEq)]
pub struct CombinedRegistration {
    /// Milliseconds
    pub sample_window: i64,
    /// Milliseconds
    pub cooldown: i64,
    /// `None` = every property
    pub properties: Option<HashSet<String>>,
    /// Excluded by every consumer
    pub excluded: HashSet<String>,
    pub needs_full_state: bool,
    pub aggregates: AggregateFlags,
    pub max_count: Option<usize>,
    pub max_age: Option<Duration>,
}

impl CombinedRegistration {
    /// Combine consumer policies; `None` when there are no consumers
    pub fn from_parameters<'a, I>(parameters: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a HistoryParameters>,
    {
        let mut iter = parameters.into_iter();
        let first = iter.next()?;

        let mut combined = Self {
            sample_window: first.sample_window_ms(),
            cooldown: first.cooldown_ms(),
            properties: first
                .properties
                .as_ref()
                .map(|p| p.iter().cloned().collect()),
            excluded: first
                .properties_to_exclude
                .iter()
                .flatten()
                .cloned()
                .collect(),
            needs_full_state: first.report_unchanged_properties,
            aggregates: first.aggregates,
            max_count: first.max_count,
            max_age: first.max_age,
        };

        for params in iter {
            combined.sample_window = combined.sample_window.min(params.sample_window_ms());
            combined.cooldown = combined.cooldown.min(params.cooldown_ms());

            combined.properties = match (combined.properties.take(), &params.properties) {
                (Some(mut union), Some(more)) => {
                    union.extend(more.iter().cloned());
                    Some(union)
                }
                _ => None,
            };

            let excluded: HashSet<String> = params
                .properties_to_exclude
                .iter()
                .flatten()
                .cloned()
                .collect();
            combined.excluded.retain(|p| excluded.contains(p));

            combined.needs_full_state |= params.report_unchanged_properties;
            combined.aggregates = combined.aggregates.union(&params.aggregates);
            combined.max_count = loosest(combined.max_count, params.max_count);
            combined.max_age = loosest(combined.max_age, params.max_age);
        }

        Some(combined)
    }

    /// Whether any consumer may want `path`
    pub fn includes_property(&self, path: &str) -> bool {
        let base = base_property(path);
        if self.excluded.contains(base) {
            return false;
        }
        match &self.properties {
            Some(props) => props.contains(base),
            None => true,
        }
    }

    /// Extra delay a consumer's own buckets wait on top of global ingestion
    ///
    /// `(consumer window − combined window) + consumer cooldown − combined
    /// cooldown`, floored at `min_cooldown`. Both differences are never
    /// negative because the combined policy takes the minimums.
    pub fn remaining_cooldown(&self, params: &HistoryParameters, min_cooldown: i64) -> i64 {
        let extra = (params.sample_window_ms() - self.sample_window)
            .saturating_add(params.cooldown_ms() - self.cooldown);
        extra.max(min_cooldown)
    }

    /// Delay after which a freshly created global bucket can be final
    pub fn flush_delay(&self) -> i64 {
        self.cooldown.saturating_add(self.sample_window)
    }
}

fn loosest<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_consumers_no_policy() {
        let none: Vec<HistoryParameters> = Vec::new();
        assert!(CombinedRegistration::from_parameters(&none).is_none());
    }

    #[test]
    fn test_union_policy() {
        let a = HistoryParameters::new()
            .with_sample_window(Duration::from_secs(5))
            .with_cooldown(Duration::from_secs(2))
            .with_properties(["Temp"])
            .excluding(["Secret", "Noise"])
            .with_max_count(10);
        let b = HistoryParameters::new()
            .with_sample_window(Duration::from_secs(1))
            .with_cooldown(Duration::from_secs(3))
            .with_properties(["Pressure"])
            .excluding(["Noise"])
            .with_max_count(50)
            .full_state();

        let combined = CombinedRegistration::from_parameters([&a, &b]).unwrap();
        assert_eq!(combined.sample_window, 1_000);
        assert_eq!(combined.cooldown, 2_000);
        assert!(combined.includes_property("Temp"));
        assert!(combined.includes_property("Pressure.[Avg]"));
        assert!(!combined.includes_property("Speed"));
        assert!(!combined.includes_property("Noise"));
        assert!(combined.needs_full_state);
        assert_eq!(combined.max_count, Some(50));
        assert_eq!(combined.max_age, None);
    }

    #[test]
    fn test_unfiltered_consumer_opens_everything() {
        let a = HistoryParameters::new().with_properties(["Temp"]);
        let b = HistoryParameters::new();
        let combined = CombinedRegistration::from_parameters([&a, &b]).unwrap();
        assert!(combined.properties.is_none());
        assert!(combined.includes_property("Anything"));
    }

    #[test]
    fn test_remaining_cooldown() {
        let fast = HistoryParameters::new().with_sample_window(Duration::from_secs(1));
        let slow = HistoryParameters::new()
            .with_sample_window(Duration::from_secs(10))
            .with_cooldown(Duration::from_secs(2));
        let combined = CombinedRegistration::from_parameters([&fast, &slow]).unwrap();

        assert_eq!(combined.remaining_cooldown(&slow, 50), 9_000 + 2_000);
        assert_eq!(combined.remaining_cooldown(&fast, 50), 50);
        assert_eq!(combined.flush_delay(), 1_000);
    }
}
