//! Linux-specific shared memory, semaphore and socket operations

use crate::error::{ShmError, ShmResult};
use memmap2::{Mmap, MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::unistd::getpid;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::Path;

/// Linux-specific memory mapping configuration
#[derive(Debug, Clone, Copy)]
pub struct LinuxMemoryConfig {
    /// Pre-fault pages with MAP_POPULATE
    pub populate: bool,
    /// Permission bits of the backing file
    pub mode: u32,
}

impl Default for LinuxMemoryConfig {
    fn default() -> Self {
        Self {
            populate: true,
            mode: shmdata_common::consts::DEFAULT_UNIX_PERMISSION,
        }
    }
}

/// Create a new backing file of `size` bytes and map it read-write.
///
/// Fails with `AlreadyExists` if the file is present.
pub fn create_segment_mmap(
    path: &Path,
    size: usize,
    config: &LinuxMemoryConfig,
) -> ShmResult<(File, MmapMut)> {
    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(config.mode)
        .open(path)?;

    file.set_len(size as u64)?;
    let mmap = map_mut(&file, config)?;
    Ok((file, mmap))
}

/// Grow the backing file and return a fresh read-write mapping of it.
pub fn resize_segment_mmap(
    file: &File,
    size: usize,
    config: &LinuxMemoryConfig,
) -> ShmResult<MmapMut> {
    file.set_len(size as u64)?;
    map_mut(file, config)
}

fn map_mut(file: &File, config: &LinuxMemoryConfig) -> ShmResult<MmapMut> {
    let mut options = MmapOptions::new();
    if config.populate {
        options.populate();
    }
    let mmap = unsafe { options.map_mut(file)? };
    Ok(mmap)
}

/// Attach to an existing backing file, read-only
pub fn attach_segment_mmap(path: &Path) -> ShmResult<(File, Mmap)> {
    let file = OpenOptions::new().read(true).open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ShmError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ShmError::Io { source: e }
        }
    })?;

    let mmap = remap_readonly(&file)?;
    Ok((file, mmap))
}

/// Map the whole current length of `file`, read-only
pub fn remap_readonly(file: &File) -> ShmResult<Mmap> {
    let mmap = unsafe { MmapOptions::new().map(file)? };
    Ok(mmap)
}

/// True when `path` names a unix domain socket
pub fn is_unix_socket(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false)
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(Errno::ESRCH) => false,
        // exists, owned by someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

/// Derive the SysV IPC key of a path: 32-bit FNV-1a, never `IPC_PRIVATE`.
pub fn semaphore_key(path: &Path) -> libc::key_t {
    use std::os::unix::ffi::OsStrExt;

    let mut hash: u32 = 0x811c_9dc5;
    for byte in path.as_os_str().as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    match hash as libc::key_t {
        libc::IPC_PRIVATE => 1,
        key => key,
    }
}

/// Raw SysV semaphore set calls.
///
/// Thin `Errno`-returning wrappers; the lock protocol lives in `crate::sem`.
pub mod sysv {
    use nix::errno::Errno;
    use std::time::{Duration, Instant};

    /// Number of semaphores in every set
    pub const SET_SIZE: libc::c_int = 2;

    /// Create a set, failing with `EEXIST` if one exists for `key`.
    pub fn create_exclusive(key: libc::key_t, mode: u32) -> Result<libc::c_int, Errno> {
        let flags = libc::IPC_CREAT | libc::IPC_EXCL | mode as libc::c_int;
        Errno::result(unsafe { libc::semget(key, SET_SIZE, flags) })
    }

    /// Look up an existing set.
    pub fn open(key: libc::key_t) -> Result<libc::c_int, Errno> {
        Errno::result(unsafe { libc::semget(key, SET_SIZE, 0) })
    }

    /// Remove the set; blocked waiters wake with `EIDRM`.
    pub fn remove(semid: libc::c_int) -> Result<(), Errno> {
        Errno::result(unsafe { libc::semctl(semid, 0, libc::IPC_RMID) }).map(drop)
    }

    /// Apply `ops` atomically.
    pub fn apply(semid: libc::c_int, ops: &mut [libc::sembuf]) -> Result<(), Errno> {
        loop {
            let res = unsafe { libc::semop(semid, ops.as_mut_ptr(), ops.len()) };
            match Errno::result(res) {
                Err(Errno::EINTR) => continue,
                other => return other.map(drop),
            }
        }
    }

    /// Apply `ops` atomically, blocking at most `timeout`. Fails with `EAGAIN` on timeout.
    pub fn apply_timed(
        semid: libc::c_int,
        ops: &mut [libc::sembuf],
        timeout: Duration,
    ) -> Result<(), Errno> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timed_semop(semid, ops, remaining) {
                Err(Errno::EINTR) => continue,
                other => return other,
            }
        }
    }

    #[cfg(target_pointer_width = "64")]
    fn timed_semop(
        semid: libc::c_int,
        ops: &mut [libc::sembuf],
        timeout: Duration,
    ) -> Result<(), Errno> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        // no semtimedop binding in the libc crate
        let res = unsafe {
            libc::syscall(
                libc::SYS_semtimedop,
                semid,
                ops.as_mut_ptr(),
                ops.len(),
                &ts as *const libc::timespec,
            )
        };
        Errno::result(res).map(drop)
    }

    #[cfg(not(target_pointer_width = "64"))]
    fn timed_semop(
        semid: libc::c_int,
        ops: &mut [libc::sembuf],
        timeout: Duration,
    ) -> Result<(), Errno> {
        let deadline = Instant::now() + timeout;
        for op in ops.iter_mut() {
            op.sem_flg |= libc::IPC_NOWAIT as libc::c_short;
        }
        loop {
            match apply(semid, ops) {
                Err(Errno::EAGAIN) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_micros(200));
                }
                other => return other,
            }
        }
    }

    /// Overwrite the value of semaphore `num`.
    pub fn set_value(semid: libc::c_int, num: u16, value: libc::c_int) -> Result<(), Errno> {
        Errno::result(unsafe { libc::semctl(semid, libc::c_int::from(num), libc::SETVAL, value) })
            .map(drop)
    }

    /// Read the value of semaphore `num`.
    pub fn get_value(semid: libc::c_int, num: u16) -> Result<libc::c_int, Errno> {
        Errno::result(unsafe { libc::semctl(semid, libc::c_int::from(num), libc::GETVAL) })
    }

    /// Build one semaphore operation.
    pub const fn op(num: u16, delta: i16, flags: libc::c_int) -> libc::sembuf {
        libc::sembuf {
            sem_num: num,
            sem_op: delta,
            sem_flg: flags as libc::c_short,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_semaphore_key_is_stable_and_distinct() {
        let a = semaphore_key(Path::new("/tmp/video"));
        let b = semaphore_key(Path::new("/tmp/video"));
        let c = semaphore_key(Path::new("/tmp/audio"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, libc::IPC_PRIVATE);
    }

    #[test]
    fn test_is_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("sock");
        let plain = dir.path().join("plain");
        std::fs::write(&plain, b"x").unwrap();

        assert!(!is_unix_socket(&sock));
        let _listener = UnixListener::bind(&sock).unwrap();
        assert!(is_unix_socket(&sock));
        assert!(!is_unix_socket(&plain));
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(get_current_pid()));
    }

    #[test]
    fn test_create_and_attach_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment");
        let config = LinuxMemoryConfig::default();

        let (_file, mut mmap) = create_segment_mmap(&path, 128, &config).unwrap();
        mmap[..4].copy_from_slice(b"abcd");

        let (_ro_file, ro) = attach_segment_mmap(&path).unwrap();
        assert_eq!(ro.len(), 128);
        assert_eq!(&ro[..4], b"abcd");

        // exclusive creation
        assert!(create_segment_mmap(&path, 128, &config).is_err());
    }

    #[test]
    fn test_timed_semop_times_out_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let key = semaphore_key(&dir.path().join("sem"));
        let semid = sysv::create_exclusive(key, 0o600).unwrap();
        sysv::set_value(semid, 0, 1).unwrap();

        let started = std::time::Instant::now();
        let mut wait_zero = [sysv::op(0, 0, 0)];
        let res = sysv::apply_timed(semid, &mut wait_zero, std::time::Duration::from_millis(60));
        assert_eq!(res, Err(nix::errno::Errno::EAGAIN));
        assert!(started.elapsed() >= std::time::Duration::from_millis(50));

        sysv::set_value(semid, 0, 0).unwrap();
        assert!(sysv::apply_timed(semid, &mut wait_zero, std::time::Duration::ZERO).is_ok());
        sysv::remove(semid).unwrap();
    }

    #[test]
    fn test_attach_missing_is_not_found() {
        let result = attach_segment_mmap(Path::new("/nonexistent/shmdata_segment"));
        assert!(matches!(result, Err(ShmError::NotFound { .. })));
    }
}
