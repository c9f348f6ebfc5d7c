//! Single writer with exclusive ownership of a path
//!
//! A [`Writer`] owns three resources named after its identity path: the
//! segment file, the semaphore set (as [`Ownership::Owner`]) and the listening
//! control socket. Frames are published through a scoped [`WriteAccess`]:
//!
//! ```text
//! get_one_write_access()  -> WriteLock acquired (waits for readers, ~1s worst case)
//! access.data_mut()[..n]   -> fill the segment
//! access.notify_clients(n) -> broadcast Data{n}, commit that many readers
//! drop(access)             -> WriteLock released; readers may now read
//! ```
//!
//! [`Ownership::Owner`]: crate::sem::Ownership::Owner

use crate::discovery::SegmentInfo;
use crate::error::{ShmError, ShmResult};
use crate::lifecycle::reclaim_path;
use crate::logger::{Logger, default_logger};
use crate::platform::{get_current_pid, semaphore_key};
use crate::protocol::{HandshakePayload, UpdateMessage};
use crate::segment::{Segment, metadata_file_path, segment_file_path, validate_segment_size};
use crate::sem::{SemaphoreSet, WriteLock};
use crate::socket::SocketServer;
use nix::errno::Errno;
use shmdata_common::config::TransportConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Liveness record on disk; removed on drop
struct MetadataFile {
    file_path: PathBuf,
    info: SegmentInfo,
}

impl MetadataFile {
    fn write(file_path: PathBuf, info: SegmentInfo, logger: &dyn Logger) -> Self {
        let meta = Self { file_path, info };
        meta.store(logger);
        meta
    }

    fn set_capacity(&mut self, capacity: usize, logger: &dyn Logger) {
        self.info.capacity = capacity;
        self.store(logger);
    }

    // best effort: the control socket is the authoritative liveness signal
    fn store(&self, logger: &dyn Logger) {
        if let Err(e) = self.info.store(&self.file_path) {
            logger.warning(format_args!(
                "writing metadata {}: {e}",
                self.file_path.display()
            ));
        }
    }
}

impl Drop for MetadataFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.file_path);
    }
}

/// Producer end of a stream
pub struct Writer {
    // drop order matters: readers are told to quit before the semaphores go
    server: SocketServer,
    sem: SemaphoreSet,
    meta: MetadataFile,
    segment: Segment,
    path: PathBuf,
    type_descriptor: String,
    recovery_timeout: Duration,
    logger: Arc<dyn Logger>,
}

impl Writer {
    /// Create a writer at `path` with default configuration and logger.
    pub fn create(path: impl AsRef<Path>, size: usize, type_descriptor: &str) -> ShmResult<Self> {
        Self::create_with_config(
            path,
            size,
            type_descriptor,
            &TransportConfig::default(),
            default_logger(),
        )
    }

    /// Create a writer at `path`.
    ///
    /// Fails with `AlreadyOwned` if a live writer holds the path. Resources
    /// left behind by a crashed writer are removed first.
    pub fn create_with_config(
        path: impl AsRef<Path>,
        size: usize,
        type_descriptor: &str,
        config: &TransportConfig,
        logger: Arc<dyn Logger>,
    ) -> ShmResult<Self> {
        let path = path.as_ref().to_path_buf();
        config.validate()?;
        validate_segment_size(size)?;
        HandshakePayload::check_descriptor(type_descriptor)?;

        let segment_file = segment_file_path(&config.effective_segment_dir(), &path);
        let sem_key = semaphore_key(&path);
        reclaim_path(&path, &segment_file, sem_key, &*logger)?;

        // the exclusive segment file is the first claim on the path
        let segment = Segment::create(segment_file, size, config.unix_permission)?;
        let meta = MetadataFile::write(
            metadata_file_path(segment.file_path()),
            SegmentInfo {
                path: path.clone(),
                type_descriptor: type_descriptor.to_string(),
                capacity: size,
                writer_pid: get_current_pid(),
                sem_key,
                created_at: SystemTime::now(),
            },
            &*logger,
        );

        let sem = SemaphoreSet::create(sem_key, config.unix_permission, Arc::clone(&logger))
            .map_err(|e| match e {
                ShmError::Semaphore {
                    source: Errno::EEXIST,
                    ..
                } => ShmError::AlreadyOwned { path: path.clone() },
                other => other,
            })?;

        let handshake = handshake_bytes(&segment, sem_key, type_descriptor)?;
        let server = SocketServer::bind(
            &path,
            handshake,
            config.socket_poll_interval(),
            config.handshake_timeout(),
            Arc::clone(&logger),
        )?;

        logger.debug(format_args!(
            "writer ready at {} ({size} bytes, {type_descriptor})",
            path.display()
        ));

        Ok(Self {
            server,
            sem,
            meta,
            segment,
            path,
            type_descriptor: type_descriptor.to_string(),
            recovery_timeout: config.crash_recovery_timeout(),
            logger,
        })
    }

    /// Lock the segment for writing.
    ///
    /// Blocks until every reader notified of the previous frame released it, or
    /// until the crash-recovery timeout force-clears stale commitments.
    pub fn get_one_write_access(&mut self) -> WriteAccess<'_> {
        let Self {
            server,
            sem,
            meta,
            segment,
            type_descriptor,
            recovery_timeout,
            logger,
            ..
        } = self;

        WriteAccess {
            lock: sem.write_lock(*recovery_timeout),
            segment,
            server,
            meta,
            sem_key: sem.key(),
            type_descriptor,
            logger: &**logger,
            frame_size: None,
            notified: false,
        }
    }

    /// Lock the segment for writing, growing it to at least `new_size` first.
    pub fn get_one_write_access_resize(&mut self, new_size: usize) -> ShmResult<WriteAccess<'_>> {
        let mut access = self.get_one_write_access();
        if let Err(e) = access.shm_resize(new_size) {
            // nothing was written
            access.notified = true;
            return Err(e);
        }
        Ok(access)
    }

    /// Copy `data` into the segment and notify readers.
    ///
    /// Returns false if `data` does not fit or the write lock could not be held.
    pub fn copy_to_shm(&mut self, data: &[u8]) -> bool {
        if data.len() > self.segment.capacity() {
            self.logger.warning(format_args!(
                "{} bytes do not fit in a {} byte segment",
                data.len(),
                self.segment.capacity()
            ));
            return false;
        }

        let mut access = self.get_one_write_access();
        if !access.is_valid() {
            access.notified = true;
            return false;
        }
        access.data_mut()[..data.len()].copy_from_slice(data);
        access.notify_clients(data.len());
        true
    }

    /// Current payload capacity
    pub fn alloc_size(&self) -> usize {
        self.segment.capacity()
    }

    /// Identity path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Type descriptor announced to readers
    pub fn type_descriptor(&self) -> &str {
        &self.type_descriptor
    }

    /// Readers that completed the handshake
    pub fn num_readers(&self) -> usize {
        self.server.num_connected()
    }
}

/// Exclusive, scoped access to the segment
///
/// Dropping an access that was never notified announces the frame size set by
/// [`WriteAccess::set_frame_size`], or the whole capacity.
pub struct WriteAccess<'a> {
    lock: WriteLock<'a>,
    segment: &'a mut Segment,
    server: &'a SocketServer,
    meta: &'a mut MetadataFile,
    sem_key: libc::key_t,
    type_descriptor: &'a str,
    logger: &'a dyn Logger,
    frame_size: Option<usize>,
    notified: bool,
}

impl WriteAccess<'_> {
    /// False if the semaphore protocol failed; exclusion is then not guaranteed
    pub fn is_valid(&self) -> bool {
        self.lock.is_valid()
    }

    /// Payload bytes
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.segment.payload_mut()
    }

    /// Raw pointer to the payload, valid until the access is dropped or resized
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.segment.payload_mut().as_mut_ptr()
    }

    /// Payload capacity
    pub fn capacity(&self) -> usize {
        self.segment.capacity()
    }

    /// Size announced on drop if `notify_clients` is never called
    pub fn set_frame_size(&mut self, size: usize) {
        self.frame_size = Some(size);
    }

    /// Announce `size` bytes to every connected reader now.
    ///
    /// Returns the number of readers committed to read this frame.
    pub fn notify_clients(&mut self, size: usize) -> usize {
        self.notified = true;
        if !self.lock.is_valid() {
            self.logger
                .warning(format_args!("not notifying readers without a write lock"));
            return 0;
        }

        let size = size.min(self.segment.capacity());
        let sent = self.server.broadcast(UpdateMessage::data(size));
        if !self.lock.commit_readers(sent) {
            return 0;
        }
        sent
    }

    /// Grow the segment to at least `new_size`. Returns whether it grew.
    pub fn shm_resize(&mut self, new_size: usize) -> ShmResult<bool> {
        if !self.segment.resize(new_size)? {
            return Ok(false);
        }

        self.server
            .set_handshake(handshake_bytes(self.segment, self.sem_key, self.type_descriptor)?);
        self.meta.set_capacity(self.segment.capacity(), self.logger);
        self.logger.debug(format_args!(
            "segment resized to {} bytes (generation {})",
            self.segment.capacity(),
            self.segment.generation()
        ));
        Ok(true)
    }
}

impl Drop for WriteAccess<'_> {
    fn drop(&mut self) {
        if !self.notified {
            let size = self.frame_size.unwrap_or_else(|| self.segment.capacity());
            self.notify_clients(size);
        }
    }
}

fn handshake_bytes(
    segment: &Segment,
    sem_key: libc::key_t,
    type_descriptor: &str,
) -> ShmResult<Vec<u8>> {
    HandshakePayload {
        capacity: segment.capacity() as u64,
        generation: segment.generation(),
        sem_key,
        writer_pid: get_current_pid(),
        type_descriptor: type_descriptor.to_string(),
        segment_file: segment.file_path().to_path_buf(),
    }
    .encode()
}
