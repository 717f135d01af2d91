//! Consumer registrations and their history policy

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregation::stats::base_property;
use crate::utils::time::duration_ms;

/// Opaque identity of one history subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerToken(Uuid);

impl ConsumerToken {
    /// Generate a fresh random token
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConsumerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConsumerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which running statistics a consumer wants next to numeric properties
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateFlags {
    pub avg: bool,
    pub min: bool,
    pub max: bool,
    pub n: bool,
}

impl AggregateFlags {
    pub const ALL: AggregateFlags = AggregateFlags {
        avg: true,
        min: true,
        max: true,
        n: true,
    };

    pub fn any(&self) -> bool {
        self.avg || self.min || self.max || self.n
    }

    pub fn union(&self, other: &AggregateFlags) -> AggregateFlags {
        AggregateFlags {
            avg: self.avg || other.avg,
            min: self.min || other.min,
            max: self.max || other.max,
            n: self.n || other.n,
        }
    }
}

/// Sampling, filtering and retention policy of one consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryParameters {
    /// Time span merged into one history item (zero = every update)
    pub sample_window: Duration,
    /// Extra delay before a window is final, to absorb late arrivals
    pub cooldown_period: Duration,
    /// Most items retained for this consumer
    pub max_count: Option<usize>,
    /// Oldest item retained for this consumer
    pub max_age: Option<Duration>,
    /// Only these properties (all when `None`)
    pub properties: Option<Vec<String>>,
    /// Never these properties
    pub properties_to_exclude: Option<Vec<String>>,
    /// Deliver full state instead of deltas
    pub report_unchanged_properties: bool,
    /// Deliver the thing's current values once after registration
    pub report_initial_values: bool,
    /// Keep the registration and its cursor across restarts
    pub persistent: bool,
    /// Idle time after which the token is dropped (config default when `None`)
    pub token_expiration: Option<Duration>,
    /// Running statistics to report for numeric properties
    pub aggregates: AggregateFlags,
}

impl Default for HistoryParameters {
    fn default() -> Self {
        Self {
            sample_window: Duration::ZERO,
            cooldown_period: Duration::ZERO,
            max_count: None,
            max_age: None,
            properties: None,
            properties_to_exclude: None,
            report_unchanged_properties: false,
            report_initial_values: false,
            persistent: false,
            token_expiration: None,
            aggregates: AggregateFlags::default(),
        }
    }
}

impl HistoryParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sample_window(mut self, window: Duration) -> Self {
        self.sample_window = window;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_period = cooldown;
        self
    }

    pub fn with_properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties = Some(properties.into_iter().map(Into::into).collect());
        self
    }

    pub fn excluding<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties_to_exclude = Some(properties.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = Some(max_count);
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn full_state(mut self) -> Self {
        self.report_unchanged_properties = true;
        self
    }

    pub fn initial_values(mut self) -> Self {
        self.report_initial_values = true;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_token_expiration(mut self, expiration: Duration) -> Self {
        self.token_expiration = Some(expiration);
        self
    }

    pub fn with_aggregates(mut self, aggregates: AggregateFlags) -> Self {
        self.aggregates = aggregates;
        self
    }

    /// Sample window in milliseconds
    pub fn sample_window_ms(&self) -> i64 {
        duration_ms(self.sample_window)
    }

    /// Cooldown in milliseconds
    pub fn cooldown_ms(&self) -> i64 {
        duration_ms(self.cooldown_period)
    }

    /// Whether this consumer wants `path` (aggregate pseudo-properties follow their base)
    pub fn includes_property(&self, path: &str) -> bool {
        let base = base_property(path);
        if let Some(excluded) = &self.properties_to_exclude {
            if excluded.iter().any(|p| p == base) {
                return false;
            }
        }
        match &self.properties {
            Some(included) => included.iter().any(|p| p == base),
            None => true,
        }
    }
}

/// One subscription: its policy plus its cursor state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerRegistration {
    pub token: ConsumerToken,
    pub thing_id: String,
    pub parameters: HistoryParameters,
    /// High-water mark delivered
    pub last_sequence_number_read: u64,
    /// High-water mark acknowledged; never above `last_sequence_number_read`
    pub sequence_number_truncated: u64,
    /// Unix milliseconds of the last call using this token
    pub last_access: i64,
    /// Sequence number of the initial-value record already delivered (0 = none)
    #[serde(default)]
    pub highest_initial_value_sequence_number: u64,
    /// Bumped whenever the cursor or policy is reset, so readers drop stale state
    #[serde(skip)]
    pub generation: u64,
}

impl ConsumerRegistration {
    /// Create a registration whose cursor starts at `start_sequence`
    pub fn new(
        token: ConsumerToken,
        thing_id: impl Into<String>,
        parameters: HistoryParameters,
        start_sequence: u64,
        now: i64,
    ) -> Self {
        Self {
            token,
            thing_id: thing_id.into(),
            parameters,
            last_sequence_number_read: start_sequence,
            sequence_number_truncated: start_sequence,
            last_access: now,
            highest_initial_value_sequence_number: 0,
            generation: 0,
        }
    }

    /// Whether the token has been idle past its expiration
    pub fn is_expired(&self, now: i64, default_expiration: Duration) -> bool {
        let expiration = self.parameters.token_expiration.unwrap_or(default_expiration);
        self.last_access.saturating_add(duration_ms(expiration)) < now
    }

    pub fn touch(&mut self, now: i64) {
        self.last_access = now;
    }

    /// Record delivery up to `sequence` (never moves backwards)
    pub fn advance_read(&mut self, sequence: u64) {
        self.last_sequence_number_read = self.last_sequence_number_read.max(sequence);
    }

    /// Acknowledge everything delivered so far
    pub fn clear(&mut self) {
        self.sequence_number_truncated = self.last_sequence_number_read;
    }

    /// Move the delivery cursor to `sequence`, keeping the truncation invariant
    pub fn rewind_to(&mut self, sequence: u64) {
        self.last_sequence_number_read = sequence;
        self.sequence_number_truncated = self.sequence_number_truncated.min(sequence);
        self.generation += 1;
    }

    /// Resume from the last acknowledged point under a new policy
    pub fn restart(&mut self, parameters: HistoryParameters) {
        self.parameters = parameters;
        self.last_sequence_number_read = self.sequence_number_truncated;
        if self.highest_initial_value_sequence_number > self.sequence_number_truncated {
            self.highest_initial_value_sequence_number = 0;
        }
        self.generation += 1;
    }
}
