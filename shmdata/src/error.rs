//! Error types for shared memory transport operations

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while creating or operating transport resources
#[derive(Error, Debug)]
pub enum ShmError {
    /// A live writer already owns this path
    #[error("Path already owned by a live writer: {}", path.display())]
    AlreadyOwned {
        /// Identity path
        path: PathBuf,
    },

    /// Segment, socket or semaphore set not found
    #[error("Resource not found: {}", path.display())]
    NotFound {
        /// Identity path
        path: PathBuf,
    },

    /// Invalid segment size
    #[error("Invalid segment size: {size} bytes")]
    InvalidSize {
        /// Attempted size in bytes
        size: usize,
    },

    /// Type descriptor does not fit the handshake payload
    #[error("Type descriptor too long: {len} bytes")]
    DescriptorTooLong {
        /// Descriptor length in bytes
        len: usize,
    },

    /// Segment file path is empty or does not fit the handshake payload
    #[error("Segment file path of {len} bytes cannot be announced")]
    SegmentPathTooLong {
        /// Path length in bytes
        len: usize,
    },

    /// A semaphore system call failed
    #[error("Semaphore {op} failed: {source}")]
    Semaphore {
        /// Operation that failed
        op: &'static str,
        /// Underlying errno
        source: nix::Error,
    },

    /// Malformed or short control-plane message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Rejected transport configuration
    #[error("Configuration error: {source}")]
    Config {
        /// Source configuration error
        #[from]
        source: shmdata_common::config::ConfigError,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;
