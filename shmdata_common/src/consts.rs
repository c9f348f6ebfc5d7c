//! Transport-wide constants for the shmdata workspace.
//!
//! Single source of truth for timeouts, wire sizes and default paths.
//! Both the configuration defaults and the wire codec read from here.

/// Ceiling on how long a writer waits for stale read commitments to clear
/// before the crash-recovery racer force-resets them (milliseconds).
pub const CRASH_RECOVERY_TIMEOUT_MS: u64 = 1000;

/// Readiness-poll timeout of every socket I/O loop (milliseconds).
///
/// Bounds how long a destructor waits for an I/O thread to observe its quit flag.
pub const SOCKET_POLL_INTERVAL_MS: u64 = 10;

/// Interval at which a follower checks for a producer socket (milliseconds).
pub const FOLLOWER_POLL_INTERVAL_MS: u64 = 30;

/// How long a client waits for the handshake to complete (milliseconds).
pub const HANDSHAKE_TIMEOUT_MS: u64 = 1000;

/// Largest segment payload a writer may allocate (1 GiB).
pub const MAX_SEGMENT_SIZE: usize = 1_073_741_824;

/// Default directory holding segment files.
pub const DEFAULT_SEGMENT_DIR: &str = "/dev/shm";

/// Prefix of every segment file name.
pub const SEGMENT_FILE_PREFIX: &str = "shmdata_";

/// Extension of the JSON liveness metadata written next to a segment.
pub const METADATA_EXTENSION: &str = "meta";

/// Default permission bits for the semaphore set and segment file.
pub const DEFAULT_UNIX_PERMISSION: u32 = 0o600;

/// Maximum length in bytes of a producer type descriptor.
pub const MAX_TYPE_DESCRIPTOR_LEN: usize = 4096;

/// Maximum length in bytes of the segment file path carried in the handshake (`PATH_MAX`).
pub const MAX_SEGMENT_PATH_LEN: usize = 4096;

/// Cache line size; the segment header occupies exactly one.
pub const CACHE_LINE_SIZE: usize = 64;

/// Magic value at the start of every segment header: `"SHMDATA\0"`.
pub const SEGMENT_MAGIC: u64 = u64::from_le_bytes(*b"SHMDATA\0");

/// Magic bytes opening every handshake payload.
pub const HANDSHAKE_MAGIC: [u8; 8] = *b"SHMDATA\x01";

/// Largest number of readers a single write can commit (semaphore ops are `i16`).
pub const MAX_COMMITTED_READERS: usize = i16::MAX as usize;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_consistent() {
        assert!(SOCKET_POLL_INTERVAL_MS > 0);
        assert!(FOLLOWER_POLL_INTERVAL_MS >= SOCKET_POLL_INTERVAL_MS);
        assert!(CRASH_RECOVERY_TIMEOUT_MS > SOCKET_POLL_INTERVAL_MS);
        assert!(HANDSHAKE_TIMEOUT_MS > 0);
    }

    #[test]
    fn magic_values_differ() {
        assert_ne!(SEGMENT_MAGIC.to_le_bytes(), HANDSHAKE_MAGIC);
        assert_eq!(&SEGMENT_MAGIC.to_le_bytes()[..7], b"SHMDATA");
    }

    #[test]
    fn commit_limit_fits_semaphore_op() {
        assert_eq!(MAX_COMMITTED_READERS, 32767);
    }
}
