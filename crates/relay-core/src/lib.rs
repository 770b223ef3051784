//! Foundational low-level utilities shared across Relay crates.
//!
//! Provides the clock abstraction used by cooldown and idle-expiry checks,
//! atomic file writes for persisted health snapshots, and uptime formatting.

pub mod atomic_io;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use time_utils::{
    current_unix_timestamp_ms, format_uptime, Clock, ManualClock, SystemClock,
};
