//! Claiming a path and cleaning up after crashed writers
//!
//! A writer that dies without running its destructors leaves behind a socket
//! file nobody listens on, its semaphore set, and its segment and metadata
//! files. Before creating anything a new writer checks the path:
//!
//! | socket file            | verdict  | action                               |
//! |------------------------|----------|--------------------------------------|
//! | absent                 | `Free`   | sweep if the `.meta` pid is dead     |
//! | present, accepts       | `Owned`  | fail with `AlreadyOwned`             |
//! | present, refuses       | `Stale`  | unlink, sweep leftovers              |
//! | present, not a socket  | `Owned`  | fail; never delete foreign files     |
//!
//! A `Free` path whose metadata names a live process belongs to a writer
//! still starting up, so it is `AlreadyOwned` as well.

use crate::discovery::SegmentInfo;
use crate::error::{ShmError, ShmResult};
use crate::logger::Logger;
use crate::platform::is_unix_socket;
use crate::segment::metadata_file_path;
use crate::sem::SemaphoreSet;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Result of probing an identity path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    /// Nothing exists at the path
    Free,
    /// A live writer (or some foreign file) occupies the path
    Owned,
    /// A socket file exists but nobody accepts on it
    Stale,
}

/// Classify what currently sits at `path`.
pub fn path_status(path: &Path) -> PathStatus {
    if std::fs::symlink_metadata(path).is_err() {
        return PathStatus::Free;
    }
    if !is_unix_socket(path) {
        return PathStatus::Owned;
    }
    match UnixStream::connect(path) {
        Ok(_) => PathStatus::Owned,
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => PathStatus::Stale,
        Err(e) if e.kind() == ErrorKind::NotFound => PathStatus::Free,
        Err(_) => PathStatus::Owned,
    }
}

/// Make `path` available to a new writer.
///
/// Fails with `AlreadyOwned` if a live writer holds it; otherwise removes any
/// stale socket, orphaned semaphore set and leftover segment files.
pub fn reclaim_path(
    path: &Path,
    segment_file: &Path,
    sem_key: libc::key_t,
    logger: &dyn Logger,
) -> ShmResult<()> {
    let already_owned = || ShmError::AlreadyOwned {
        path: path.to_path_buf(),
    };

    match path_status(path) {
        PathStatus::Owned => Err(already_owned()),
        PathStatus::Stale => {
            logger.debug(format_args!(
                "removing dead control socket {}",
                path.display()
            ));
            std::fs::remove_file(path)?;
            sweep(path, segment_file, sem_key, logger)
        }
        PathStatus::Free => match SegmentInfo::load(&metadata_file_path(segment_file)) {
            Ok(info) if info.is_alive() => Err(already_owned()),
            Ok(info) => {
                logger.debug(format_args!(
                    "previous writer {} of {} is gone",
                    info.writer_pid,
                    path.display()
                ));
                sweep(path, segment_file, sem_key, logger)
            }
            Err(_) => Ok(()),
        },
    }
}

fn sweep(
    path: &Path,
    segment_file: &Path,
    sem_key: libc::key_t,
    logger: &dyn Logger,
) -> ShmResult<()> {
    if SemaphoreSet::force_remove(sem_key, logger) {
        logger.debug(format_args!(
            "removed orphaned semaphore set for {}",
            path.display()
        ));
    }

    for leftover in [metadata_file_path(segment_file), segment_file.to_path_buf()] {
        match std::fs::remove_file(&leftover) {
            Ok(()) => logger.debug(format_args!("removed leftover {}", leftover.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::default_logger;
    use crate::platform::semaphore_key;
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_path_states() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl");
        assert_eq!(path_status(&path), PathStatus::Free);

        let listener = UnixListener::bind(&path).unwrap();
        assert_eq!(path_status(&path), PathStatus::Owned);

        // the file outlives the listener, like after a crash
        drop(listener);
        assert_eq!(path_status(&path), PathStatus::Stale);

        let plain = dir.path().join("plain");
        std::fs::write(&plain, b"user data").unwrap();
        assert_eq!(path_status(&plain), PathStatus::Owned);
    }

    #[test]
    fn test_reclaim_sweeps_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl");
        let segment_file = dir.path().join("shmdata_seg");
        let key = semaphore_key(&path);

        drop(UnixListener::bind(&path).unwrap());
        std::fs::write(&segment_file, b"old").unwrap();
        std::fs::write(metadata_file_path(&segment_file), b"{}").unwrap();
        let orphan = SemaphoreSet::create(key, 0o600, default_logger()).unwrap();
        // leak it as a crashed writer would
        std::mem::forget(orphan);

        reclaim_path(&path, &segment_file, key, &*default_logger()).unwrap();
        assert!(!path.exists());
        assert!(!segment_file.exists());
        assert!(!metadata_file_path(&segment_file).exists());
        assert!(SemaphoreSet::attach(key, default_logger()).is_err());
    }

    #[test]
    fn test_reclaim_refuses_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl");
        let _listener = UnixListener::bind(&path).unwrap();
        let result = reclaim_path(
            &path,
            &dir.path().join("seg"),
            semaphore_key(&path),
            &*default_logger(),
        );
        assert!(matches!(result, Err(ShmError::AlreadyOwned { .. })));
        assert!(path.exists());
    }

    fn write_meta(segment_file: &Path, path: &Path, pid: u32) {
        SegmentInfo {
            path: path.to_path_buf(),
            type_descriptor: String::new(),
            capacity: 8,
            writer_pid: pid,
            sem_key: semaphore_key(path),
            created_at: std::time::SystemTime::now(),
        }
        .store(&metadata_file_path(segment_file))
        .unwrap();
    }

    #[test]
    fn test_free_path_with_dead_metadata_is_swept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl");
        let segment_file = dir.path().join("shmdata_seg");
        std::fs::write(&segment_file, b"old").unwrap();
        write_meta(&segment_file, &path, 0x7fff_fff0);

        reclaim_path(&path, &segment_file, semaphore_key(&path), &*default_logger()).unwrap();
        assert!(!segment_file.exists());
        assert!(!metadata_file_path(&segment_file).exists());
    }

    #[test]
    fn test_free_path_with_live_metadata_is_owned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl");
        let segment_file = dir.path().join("shmdata_seg");
        write_meta(&segment_file, &path, crate::platform::get_current_pid());

        let result = reclaim_path(&path, &segment_file, semaphore_key(&path), &*default_logger());
        assert!(matches!(result, Err(ShmError::AlreadyOwned { .. })));
        assert!(metadata_file_path(&segment_file).exists());
    }
}
