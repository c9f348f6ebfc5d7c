//! Prelude module for common re-exports.
//!
//! `use shmdata_common::prelude::*;` brings in the configuration types and the
//! transport timing defaults.

use std::time::Duration;

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, TransportConfig};

// ─── Transport Constants ────────────────────────────────────────────
pub use crate::consts::{
    CRASH_RECOVERY_TIMEOUT_MS, FOLLOWER_POLL_INTERVAL_MS, MAX_TYPE_DESCRIPTOR_LEN,
    SOCKET_POLL_INTERVAL_MS,
};

/// Crash-recovery ceiling as a `Duration`.
pub const CRASH_RECOVERY_TIMEOUT: Duration = Duration::from_millis(CRASH_RECOVERY_TIMEOUT_MS);

/// Socket poll timeout as a `Duration`.
pub const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(SOCKET_POLL_INTERVAL_MS);
