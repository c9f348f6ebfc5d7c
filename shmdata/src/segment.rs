//! Shared memory segment structures and operations
//!
//! A segment is a file-backed mapping made of a one-cache-line
//! [`SegmentHeader`] followed by the payload. The writer owns the file
//! ([`Segment`]); readers map it read-only ([`SegmentView`]). The header
//! carries the capacity and a generation counter bumped on every resize, so a
//! reader can tell its mapping is stale.
//!
//! No lock lives here: cross-process exclusion is the job of `crate::sem`.

use crate::error::{ShmError, ShmResult};
use crate::platform::{
    LinuxMemoryConfig, attach_segment_mmap, create_segment_mmap, get_current_pid,
    remap_readonly, resize_segment_mmap,
};
use memmap2::{Mmap, MmapMut};
use shmdata_common::consts::{
    CACHE_LINE_SIZE, MAX_SEGMENT_SIZE, METADATA_EXTENSION, SEGMENT_FILE_PREFIX, SEGMENT_MAGIC,
};
use static_assertions::const_assert_eq;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Segment header with cache-line alignment
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Magic number for validation
    pub magic: u64,
    /// Bumped each time the writer remaps the segment
    pub generation: AtomicU64,
    /// Payload capacity in bytes
    pub capacity: AtomicU64,
    /// Writer process ID
    pub writer_pid: AtomicU32,
    _padding: [u8; 36],
}

const_assert_eq!(core::mem::size_of::<SegmentHeader>(), CACHE_LINE_SIZE);

/// Byte offset of the payload inside the mapping
pub const HEADER_SIZE: usize = core::mem::size_of::<SegmentHeader>();

impl SegmentHeader {
    /// Create new segment header
    pub fn new(capacity: usize, writer_pid: u32) -> Self {
        Self {
            magic: SEGMENT_MAGIC,
            generation: AtomicU64::new(0),
            capacity: AtomicU64::new(capacity as u64),
            writer_pid: AtomicU32::new(writer_pid),
            _padding: [0; 36],
        }
    }

    /// Validate header magic
    pub fn validate(&self) -> ShmResult<()> {
        if self.magic != SEGMENT_MAGIC {
            return Err(ShmError::Protocol(format!(
                "bad segment magic {:#018x}",
                self.magic
            )));
        }
        Ok(())
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Current payload capacity
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire) as usize
    }
}

/// File holding the segment of the stream published at `path`.
pub fn segment_file_path(segment_dir: &Path, path: &Path) -> PathBuf {
    let flattened = path.to_string_lossy().replace('/', "_");
    segment_dir.join(format!("{SEGMENT_FILE_PREFIX}{flattened}"))
}

/// JSON liveness metadata sitting next to a segment file.
pub fn metadata_file_path(segment_file: &Path) -> PathBuf {
    let mut name = segment_file.as_os_str().to_owned();
    name.push(".");
    name.push(METADATA_EXTENSION);
    PathBuf::from(name)
}

/// Validate segment size constraints
pub fn validate_segment_size(size: usize) -> ShmResult<()> {
    if size > MAX_SEGMENT_SIZE {
        return Err(ShmError::InvalidSize { size });
    }
    Ok(())
}

/// Writer-side segment: owns the backing file and unlinks it on drop
pub struct Segment {
    file_path: PathBuf,
    file: File,
    mmap: MmapMut,
    config: LinuxMemoryConfig,
}

impl Segment {
    /// Exclusively create the backing file and initialise its header
    pub fn create(file_path: PathBuf, capacity: usize, mode: u32) -> ShmResult<Self> {
        validate_segment_size(capacity)?;

        let config = LinuxMemoryConfig {
            mode,
            ..LinuxMemoryConfig::default()
        };
        let (file, mut mmap) = create_segment_mmap(&file_path, HEADER_SIZE + capacity, &config)
            .map_err(|e| match e {
                ShmError::Io { source } if source.kind() == std::io::ErrorKind::AlreadyExists => {
                    ShmError::AlreadyOwned {
                        path: file_path.clone(),
                    }
                }
                other => other,
            })?;

        unsafe {
            (mmap.as_mut_ptr() as *mut SegmentHeader)
                .write(SegmentHeader::new(capacity, get_current_pid()));
        }

        Ok(Self {
            file_path,
            file,
            mmap,
            config,
        })
    }

    /// Get header
    pub fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.mmap.as_ptr() as *const SegmentHeader) }
    }

    /// Payload capacity in bytes
    pub fn capacity(&self) -> usize {
        self.mmap.len() - HEADER_SIZE
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.header().generation()
    }

    /// Backing file location
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Payload as a mutable slice
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[HEADER_SIZE..]
    }

    /// Grow the payload to at least `capacity` bytes.
    ///
    /// Must only be called while the write lock is held. Never shrinks, so a
    /// reader holding an older, shorter mapping stays within the file.
    pub fn resize(&mut self, capacity: usize) -> ShmResult<bool> {
        if capacity <= self.capacity() {
            return Ok(false);
        }
        validate_segment_size(capacity)?;

        self.mmap = resize_segment_mmap(&self.file, HEADER_SIZE + capacity, &self.config)?;
        let header = self.header();
        header.capacity.store(capacity as u64, Ordering::Release);
        header.generation.fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.file_path);
    }
}

/// Reader-side read-only mapping of a segment
pub struct SegmentView {
    file: File,
    mmap: Mmap,
    generation: u64,
}

impl SegmentView {
    /// Map an existing segment and validate its header
    pub fn attach(file_path: &Path) -> ShmResult<Self> {
        let (file, mmap) = attach_segment_mmap(file_path)?;
        let mut view = Self {
            file,
            mmap,
            generation: 0,
        };
        view.generation = view.header()?.generation();
        Ok(view)
    }

    fn header(&self) -> ShmResult<&SegmentHeader> {
        if self.mmap.len() < HEADER_SIZE {
            return Err(ShmError::InvalidSize {
                size: self.mmap.len(),
            });
        }
        let header = unsafe { &*(self.mmap.as_ptr() as *const SegmentHeader) };
        header.validate()?;
        Ok(header)
    }

    /// Remap if the writer resized since the last look.
    ///
    /// Only call while holding a read lock: the writer resizes under its write lock.
    pub fn refresh(&mut self) -> ShmResult<bool> {
        let header = self.header()?;
        let generation = header.generation();
        let capacity = header.capacity();
        if generation == self.generation && capacity <= self.capacity() {
            return Ok(false);
        }
        self.mmap = remap_readonly(&self.file)?;
        self.generation = self.header()?.generation();
        Ok(true)
    }

    /// Generation this mapping was taken at
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Mapped payload capacity
    pub fn capacity(&self) -> usize {
        self.mmap.len().saturating_sub(HEADER_SIZE)
    }

    /// First `len` payload bytes, clamped to the mapped capacity
    pub fn payload(&self, len: usize) -> &[u8] {
        let end = HEADER_SIZE + len.min(self.capacity());
        &self.mmap[HEADER_SIZE..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_SIZE, 64);
        assert_eq!(core::mem::align_of::<SegmentHeader>(), 64);
    }

    #[test]
    fn test_header_validation() {
        let header = SegmentHeader::new(64, 12345);
        assert!(header.validate().is_ok());
        assert_eq!(header.capacity(), 64);
        assert_eq!(header.generation(), 0);

        let mut invalid_header = header;
        invalid_header.magic = 0;
        assert!(invalid_header.validate().is_err());
    }

    #[test]
    fn test_file_naming() {
        let file = segment_file_path(Path::new("/dev/shm"), Path::new("/tmp/video"));
        assert_eq!(file, PathBuf::from("/dev/shm/shmdata__tmp_video"));
        assert_eq!(
            metadata_file_path(&file),
            PathBuf::from("/dev/shm/shmdata__tmp_video.meta")
        );
    }

    #[test]
    fn test_create_write_and_view() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("seg");
        let mut segment = Segment::create(file_path.clone(), 64, 0o600).unwrap();
        assert_eq!(segment.capacity(), 64);
        segment.payload_mut()[..5].copy_from_slice(b"hello");

        let view = SegmentView::attach(&file_path).unwrap();
        assert_eq!(view.capacity(), 64);
        assert_eq!(view.payload(5), b"hello");
        // clamped to capacity
        assert_eq!(view.payload(1000).len(), 64);
    }

    #[test]
    fn test_exclusive_creation() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("seg");
        let _segment = Segment::create(file_path.clone(), 64, 0o600).unwrap();
        assert!(matches!(
            Segment::create(file_path, 64, 0o600),
            Err(ShmError::AlreadyOwned { .. })
        ));
    }

    #[test]
    fn test_resize_bumps_generation_and_view_follows() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("seg");
        let mut segment = Segment::create(file_path.clone(), 64, 0o600).unwrap();
        let mut view = SegmentView::attach(&file_path).unwrap();

        assert!(!segment.resize(32).unwrap(), "shrinking is a no-op");
        assert!(segment.resize(4096).unwrap());
        assert_eq!(segment.capacity(), 4096);
        assert_eq!(segment.generation(), 1);
        segment.payload_mut()[4000] = 0x5A;

        assert_eq!(view.capacity(), 64);
        assert!(view.refresh().unwrap());
        assert_eq!(view.capacity(), 4096);
        assert_eq!(view.generation(), 1);
        assert_eq!(view.payload(4096)[4000], 0x5A);
        assert!(!view.refresh().unwrap());
    }

    #[test]
    fn test_oversize_rejected() {
        assert!(validate_segment_size(MAX_SEGMENT_SIZE).is_ok());
        assert!(matches!(
            validate_segment_size(MAX_SEGMENT_SIZE + 1),
            Err(ShmError::InvalidSize { .. })
        ));
    }

    #[test]
    fn test_drop_unlinks_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("seg");
        {
            let _segment = Segment::create(file_path.clone(), 8, 0o600).unwrap();
            assert!(file_path.exists());
        }
        assert!(!file_path.exists());
    }
}
