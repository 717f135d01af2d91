//! Historian configuration
//!
//! Defaults suit an embedded historian; every field can be overridden
//! programmatically, and the most common ones through environment variables.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Seven days, the default lifetime of an idle consumer token
pub const DEFAULT_TOKEN_EXPIRATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Configuration for a [`Historian`](crate::Historian)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorianConfig {
    /// Root directory for persisted streams and registrations (`None` = memory only)
    pub data_dir: Option<PathBuf>,
    /// Shortest delay the flush timer is ever armed for
    pub min_timer_wait: Duration,
    /// Floor for a consumer's remaining cooldown
    pub min_cooldown: Duration,
    /// How often the flush timer triggers retention cleanup
    pub cleanup_interval: Duration,
    /// Hard cap on a single blocking history read
    pub max_wait: Duration,
    /// Poll cadence for waits and timers once shutdown has started
    pub shutdown_poll: Duration,
    /// Token expiration applied when a consumer doesn't specify one
    pub default_token_expiration: Duration,
}

impl Default for HistorianConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            min_timer_wait: Duration::from_millis(100),
            min_cooldown: Duration::from_millis(50),
            cleanup_interval: Duration::from_secs(120),
            max_wait: Duration::from_secs(15 * 60),
            shutdown_poll: Duration::from_secs(1),
            default_token_expiration: DEFAULT_TOKEN_EXPIRATION,
        }
    }
}

impl HistorianConfig {
    /// Create an in-memory config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config that persists under `data_dir`
    pub fn with_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: Some(data_dir.as_ref().to_path_buf()),
            ..Default::default()
        }
    }

    /// Build a config from defaults plus `HISTORIAN_*` environment overrides
    ///
    /// Relative data directories resolve against the current directory.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = env::var("HISTORIAN_DATA_DIR") {
            let path = PathBuf::from(dir);
            config.data_dir = Some(if path.is_absolute() {
                path
            } else {
                env::current_dir()
                    .unwrap_or_else(|_| PathBuf::from("."))
                    .join(path)
            });
        }
        if let Some(ms) = env_u64("HISTORIAN_MIN_TIMER_WAIT_MS") {
            config.min_timer_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("HISTORIAN_MIN_COOLDOWN_MS") {
            config.min_cooldown = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("HISTORIAN_CLEANUP_INTERVAL_SECS") {
            config.cleanup_interval = Duration::from_secs(secs);
        }

        config
    }

    /// Directory holding one JSONL file per thing stream
    pub fn streams_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("streams"))
    }

    /// Path of the stream file for `thing_id`
    pub fn stream_path(&self, thing_id: &str) -> Option<PathBuf> {
        self.streams_dir()
            .map(|dir| dir.join(format!("{}.jsonl", urlencoding::encode(thing_id))))
    }

    /// Path of the persisted consumer registration table
    pub fn registrations_path(&self) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join("registrations.jsonl"))
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
