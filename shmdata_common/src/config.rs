//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration for
//! shmdata producers and consumers.
//!
//! # Usage
//!
//! ```rust,no_run
//! use shmdata_common::config::{ConfigLoader, ConfigError, TransportConfig};
//! use serde::Deserialize;
//! use std::path::Path;
//!
//! #[derive(Debug, Deserialize)]
//! struct MyAppConfig {
//!     transport: TransportConfig,
//!     socket_path: String,
//! }
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = MyAppConfig::load(Path::new("config.toml"))?;
//!     config.transport.validate()?;
//!     println!("Publishing on {}", config.socket_path);
//!     Ok(())
//! }
//! ```

use crate::consts::{
    CRASH_RECOVERY_TIMEOUT_MS, DEFAULT_SEGMENT_DIR, DEFAULT_UNIX_PERMISSION,
    FOLLOWER_POLL_INTERVAL_MS, HANDSHAKE_TIMEOUT_MS, SOCKET_POLL_INTERVAL_MS,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Tunables shared by writers, readers and followers.
///
/// Every field has a default, so an empty `[transport]` table is valid.
///
/// # TOML Example
///
/// ```toml
/// [transport]
/// log_level = "debug"
/// crash_recovery_timeout_ms = 500
/// segment_dir = "/run/shmdata"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Logging verbosity level.
    pub log_level: LogLevel,
    /// Ceiling on a write lock acquisition before stale commitments are reset.
    pub crash_recovery_timeout_ms: u64,
    /// Readiness-poll timeout of socket I/O threads.
    pub socket_poll_interval_ms: u64,
    /// Probe interval of a follower waiting for its producer.
    pub follower_poll_interval_ms: u64,
    /// How long a client waits for the handshake.
    pub handshake_timeout_ms: u64,
    /// Directory holding segment files and their metadata.
    pub segment_dir: PathBuf,
    /// Permission bits of the semaphore set and segment file.
    pub unix_permission: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            crash_recovery_timeout_ms: CRASH_RECOVERY_TIMEOUT_MS,
            socket_poll_interval_ms: SOCKET_POLL_INTERVAL_MS,
            follower_poll_interval_ms: FOLLOWER_POLL_INTERVAL_MS,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
            segment_dir: PathBuf::from(DEFAULT_SEGMENT_DIR),
            unix_permission: DEFAULT_UNIX_PERMISSION,
        }
    }
}

impl TransportConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - any interval or timeout is zero
    /// - the crash-recovery timeout is shorter than the socket poll interval
    /// - the permission bits exceed `0o777`
    pub fn validate(&self) -> Result<(), ConfigError> {
        let named = [
            ("crash_recovery_timeout_ms", self.crash_recovery_timeout_ms),
            ("socket_poll_interval_ms", self.socket_poll_interval_ms),
            ("follower_poll_interval_ms", self.follower_poll_interval_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
        ];
        for (name, value) in named {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.crash_recovery_timeout_ms < self.socket_poll_interval_ms {
            return Err(ConfigError::ValidationError(
                "crash_recovery_timeout_ms cannot be shorter than socket_poll_interval_ms"
                    .to_string(),
            ));
        }
        if self.unix_permission > 0o777 {
            return Err(ConfigError::ValidationError(format!(
                "unix_permission {:#o} is not a permission mask",
                self.unix_permission
            )));
        }
        Ok(())
    }

    /// Crash-recovery ceiling as a `Duration`.
    pub fn crash_recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.crash_recovery_timeout_ms)
    }

    /// Socket poll timeout as a `Duration`.
    pub fn socket_poll_interval(&self) -> Duration {
        Duration::from_millis(self.socket_poll_interval_ms)
    }

    /// Follower poll interval as a `Duration`.
    pub fn follower_poll_interval(&self) -> Duration {
        Duration::from_millis(self.follower_poll_interval_ms)
    }

    /// Handshake wait as a `Duration`.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Directory where segment files actually live.
    ///
    /// Falls back to the system temp dir when the configured one is missing
    /// (containers without `/dev/shm`).
    pub fn effective_segment_dir(&self) -> PathBuf {
        if self.segment_dir.is_dir() {
            self.segment_dir.clone()
        } else {
            std::env::temp_dir()
        }
    }
}

/// Trait for loading configuration from TOML files.
///
/// This trait provides a default implementation that works with any type
/// implementing `serde::de::DeserializeOwned`.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation: any serde-deserializable struct can use ConfigLoader.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
