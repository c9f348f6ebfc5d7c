//! Segment discovery and liveness metadata
//!
//! Every writer leaves a JSON `.meta` file next to its segment file. The
//! control socket stays authoritative for liveness; these records let tools
//! enumerate streams and spot ones whose writer died without cleaning up.

use crate::error::ShmResult;
use crate::logger::{Logger, default_logger};
use crate::platform::is_process_alive;
use crate::segment::metadata_file_path;
use crate::sem::SemaphoreSet;
use serde::{Deserialize, Serialize};
use shmdata_common::consts::{METADATA_EXTENSION, SEGMENT_FILE_PREFIX};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Liveness record of one published stream
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    /// Identity path (the control socket)
    pub path: PathBuf,
    /// Producer type descriptor
    pub type_descriptor: String,
    /// Payload capacity in bytes
    pub capacity: usize,
    /// Writer process ID
    pub writer_pid: u32,
    /// SysV key of the semaphore set
    pub sem_key: i32,
    /// Creation timestamp
    pub created_at: SystemTime,
}

impl SegmentInfo {
    /// Write this record to `meta_path`.
    pub fn store(&self, meta_path: &Path) -> ShmResult<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(meta_path, json)?;
        Ok(())
    }

    /// Read a record back.
    pub fn load(meta_path: &Path) -> ShmResult<Self> {
        let content = std::fs::read(meta_path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// True if the recorded writer process still exists
    pub fn is_alive(&self) -> bool {
        is_process_alive(self.writer_pid)
    }
}

/// Discovery statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    /// Number of records found
    pub total_segments: usize,
    /// Records whose writer is alive
    pub active_writers: usize,
    /// Records whose writer is gone
    pub orphaned_segments: usize,
}

/// Scans a segment directory for liveness records
pub struct SegmentDiscovery {
    segment_dir: PathBuf,
    known_segments: HashMap<PathBuf, SegmentInfo>,
    logger: Arc<dyn Logger>,
}

impl SegmentDiscovery {
    /// Discovery over `segment_dir`
    pub fn new(segment_dir: impl Into<PathBuf>) -> Self {
        Self {
            segment_dir: segment_dir.into(),
            known_segments: HashMap::new(),
            logger: default_logger(),
        }
    }

    /// List every readable record, newest first.
    pub fn list_segments(&self) -> ShmResult<Vec<SegmentInfo>> {
        let mut segments = Vec::new();
        if !self.segment_dir.exists() {
            return Ok(segments);
        }

        for entry in std::fs::read_dir(&self.segment_dir)?.flatten() {
            let file_path = entry.path();
            if !is_metadata_file(&file_path) {
                continue;
            }
            match SegmentInfo::load(&file_path) {
                Ok(info) => segments.push(info),
                Err(e) => self.logger.debug(format_args!(
                    "skipping unreadable metadata {}: {e}",
                    file_path.display()
                )),
            }
        }

        segments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(segments)
    }

    /// Find the live record for the stream published at `path`.
    pub fn find_segment(&self, path: &Path) -> ShmResult<Option<SegmentInfo>> {
        if let Some(info) = self.known_segments.get(path) {
            if info.is_alive() {
                return Ok(Some(info.clone()));
            }
        }

        Ok(self
            .list_segments()?
            .into_iter()
            .find(|info| info.path == path && info.is_alive()))
    }

    /// Remember a record.
    pub fn update_segment_cache(&mut self, info: SegmentInfo) {
        self.known_segments.insert(info.path.clone(), info);
    }

    /// Remove every resource of records whose writer is dead. Returns how many.
    pub fn cleanup_orphaned_segments(&mut self) -> ShmResult<usize> {
        let mut cleaned = 0;
        for info in self.list_segments()? {
            if info.is_alive() {
                continue;
            }
            self.logger.debug(format_args!(
                "cleaning up orphaned stream {} (pid {})",
                info.path.display(),
                info.writer_pid
            ));
            SemaphoreSet::force_remove(info.sem_key, &*self.logger);
            let segment_file = crate::segment::segment_file_path(&self.segment_dir, &info.path);
            let _ = std::fs::remove_file(metadata_file_path(&segment_file));
            let _ = std::fs::remove_file(&segment_file);
            if crate::platform::is_unix_socket(&info.path) {
                let _ = std::fs::remove_file(&info.path);
            }
            self.known_segments.remove(&info.path);
            cleaned += 1;
        }
        Ok(cleaned)
    }

    /// Get discovery statistics
    pub fn get_statistics(&self) -> DiscoveryStats {
        let segments = self.list_segments().unwrap_or_default();
        let active_writers = segments.iter().filter(|s| s.is_alive()).count();
        DiscoveryStats {
            total_segments: segments.len(),
            active_writers,
            orphaned_segments: segments.len() - active_writers,
        }
    }
}

fn is_metadata_file(path: &Path) -> bool {
    let named = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(SEGMENT_FILE_PREFIX));
    named && path.extension().is_some_and(|ext| ext == METADATA_EXTENSION)
}
