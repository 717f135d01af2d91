//! Utility functions and helpers
//!
//! Clock/window arithmetic and atomic JSONL persistence.

pub mod atomic;
pub mod time;

pub use atomic::{atomic_write_with, cleanup_temp_files, read_jsonl, write_jsonl};
pub use time::{duration_ms, ms_duration, now_millis, window_end, window_start};
