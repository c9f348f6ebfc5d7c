//! Reader/writer exclusion over a SysV semaphore pair
//!
//! Two counters guard a segment across processes:
//!
//! - `PENDING` (sem 0): outstanding read commitments, plus one token held by a
//!   writer while it writes.
//! - `WRITER_ACTIVE` (sem 1): 1 while a writer holds the lock.
//!
//! ```text
//! WriteLock::acquire   wait PENDING == 0, WRITER_ACTIVE += 1, PENDING += 1   (atomic)
//! commit_readers(N)    PENDING += N
//! WriteLock::drop      PENDING -= 1, WRITER_ACTIVE -= 1                      (atomic)
//! ReadLock::acquire    wait WRITER_ACTIVE == 0 (semtimedop, bounded)
//! ReadLock::drop       PENDING -= 1
//! ```
//!
//! A reader that dies between notification and release leaves its commitment
//! behind, which would stall the next writer forever. Every write lock
//! acquisition therefore races a short-lived thread that force-resets
//! `PENDING` to 0 once the crash-recovery timeout elapses.
//!
//! Decrements use `IPC_NOWAIT`: after a forced reset a late release must not
//! block on a counter that is already 0.

use crate::error::{ShmError, ShmResult};
use crate::logger::Logger;
use crate::platform::sysv;
use nix::errno::Errno;
use parking_lot::{Condvar, Mutex};
use shmdata_common::consts::MAX_COMMITTED_READERS;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Outstanding read commitments (plus the writer's own token)
pub const PENDING: u16 = 0;
/// 1 while a writer holds the lock
pub const WRITER_ACTIVE: u16 = 1;

const NOWAIT: libc::c_int = libc::IPC_NOWAIT;

/// Who may destroy the semaphore set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Created the set; removes it on drop
    Owner,
    /// Looked the set up; never removes it
    Attached,
}

/// Handle on a two-semaphore set identified by a SysV key
pub struct SemaphoreSet {
    key: libc::key_t,
    semid: libc::c_int,
    ownership: Ownership,
    logger: Arc<dyn Logger>,
}

impl SemaphoreSet {
    /// Exclusively create the set for `key`; both counters start at 0.
    pub fn create(key: libc::key_t, mode: u32, logger: Arc<dyn Logger>) -> ShmResult<Self> {
        let semid = sysv::create_exclusive(key, mode).map_err(|source| ShmError::Semaphore {
            op: "semget(IPC_EXCL)",
            source,
        })?;
        Ok(Self {
            key,
            semid,
            ownership: Ownership::Owner,
            logger,
        })
    }

    /// Attach to the set a writer created for `key`.
    pub fn attach(key: libc::key_t, logger: Arc<dyn Logger>) -> ShmResult<Self> {
        let semid = sysv::open(key).map_err(|source| ShmError::Semaphore {
            op: "semget",
            source,
        })?;
        Ok(Self {
            key,
            semid,
            ownership: Ownership::Attached,
            logger,
        })
    }

    /// Remove whatever set exists for `key`. Returns true if one was found.
    ///
    /// Only for cleaning up after a writer that died without releasing ownership.
    pub fn force_remove(key: libc::key_t, logger: &dyn Logger) -> bool {
        let semid = match sysv::open(key) {
            Ok(semid) => semid,
            Err(e) => {
                logger.debug(format_args!("semget (forcing semaphore cleaning): {e}"));
                return false;
            }
        };
        if let Err(e) = sysv::remove(semid) {
            logger.error(format_args!("semctl removing stale semaphore: {e}"));
        }
        true
    }

    /// SysV key
    pub fn key(&self) -> libc::key_t {
        self.key
    }

    /// Owner or attached
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Current value of `PENDING`
    pub fn pending(&self) -> ShmResult<i32> {
        sysv::get_value(self.semid, PENDING).map_err(|source| ShmError::Semaphore {
            op: "semctl(GETVAL)",
            source,
        })
    }

    /// Current value of `WRITER_ACTIVE`
    pub fn writer_active(&self) -> ShmResult<i32> {
        sysv::get_value(self.semid, WRITER_ACTIVE).map_err(|source| ShmError::Semaphore {
            op: "semctl(GETVAL)",
            source,
        })
    }

    /// Wait (up to `timeout`) until no writer is active.
    pub fn read_lock(&self, timeout: Duration) -> ReadLock<'_> {
        ReadLock::acquire(self, timeout)
    }

    /// Acquire exclusive write access, resetting stale commitments after `recovery_timeout`.
    pub fn write_lock(&self, recovery_timeout: Duration) -> WriteLock<'_> {
        WriteLock::acquire(self, recovery_timeout)
    }

    /// Consume one commitment without reading.
    pub fn cancel_committed_reader(&self) {
        self.release_commitment("cancel");
    }

    fn release_commitment(&self, context: &str) {
        let mut ops = [sysv::op(PENDING, -1, NOWAIT)];
        match sysv::apply(self.semid, &mut ops) {
            Ok(()) => {}
            Err(Errno::EAGAIN) => self.logger.debug(format_args!(
                "semop {context}: commitment already cleared by crash recovery"
            )),
            // writer tore the set down meanwhile
            Err(Errno::EIDRM | Errno::EINVAL) => self
                .logger
                .debug(format_args!("semop {context}: semaphore set removed")),
            Err(e) => self.logger.error(format_args!("semop {context}: {e}")),
        }
    }
}

impl Drop for SemaphoreSet {
    fn drop(&mut self) {
        if self.ownership == Ownership::Owner {
            if let Err(e) = sysv::remove(self.semid) {
                self.logger
                    .error(format_args!("semctl removing semaphore: {e}"));
            }
        }
    }
}

/// Scoped read access; releases one commitment on drop
pub struct ReadLock<'a> {
    sem: &'a SemaphoreSet,
    valid: bool,
}

impl<'a> ReadLock<'a> {
    fn acquire(sem: &'a SemaphoreSet, timeout: Duration) -> Self {
        let mut ops = [sysv::op(WRITER_ACTIVE, 0, 0)];
        match sysv::apply_timed(sem.semid, &mut ops, timeout) {
            Ok(()) => Self { sem, valid: true },
            Err(Errno::EAGAIN) => {
                sem.logger.warning(format_args!(
                    "semop ReadLock: writer still active after {timeout:?}"
                ));
                Self { sem, valid: false }
            }
            Err(e) => {
                sem.logger.debug(format_args!("semop ReadLock: {e}"));
                Self { sem, valid: false }
            }
        }
    }

    /// True if no writer was active when the lock was taken
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Drop for ReadLock<'_> {
    fn drop(&mut self) {
        // the commitment was issued for this reader whether or not it read
        self.sem.release_commitment("ReadLock release");
    }
}

/// Scoped write access; holds the writer token until dropped
pub struct WriteLock<'a> {
    sem: &'a SemaphoreSet,
    valid: bool,
    recovered: bool,
}

impl<'a> WriteLock<'a> {
    fn acquire(sem: &'a SemaphoreSet, recovery_timeout: Duration) -> Self {
        let acquired = Mutex::new(false);
        let cv = Condvar::new();
        let recovered = AtomicBool::new(false);

        let result = std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut done = acquired.lock();
                cv.wait_while_for(&mut done, |done| !*done, recovery_timeout);
                if !*done {
                    sem.logger.error(format_args!(
                        "write lock blocked for {recovery_timeout:?} by stale reader commitments, resetting"
                    ));
                    if let Err(e) = sysv::set_value(sem.semid, PENDING, 0) {
                        sem.logger
                            .error(format_args!("semctl resetting reader semaphore: {e}"));
                    }
                    recovered.store(true, Ordering::Release);
                }
            });

            let mut ops = [
                sysv::op(PENDING, 0, 0),
                sysv::op(WRITER_ACTIVE, 1, 0),
                sysv::op(PENDING, 1, 0),
            ];
            let result = sysv::apply(sem.semid, &mut ops);
            *acquired.lock() = true;
            cv.notify_one();
            result
        });

        let recovered = recovered.load(Ordering::Acquire);
        match result {
            Ok(()) => {
                if recovered {
                    // the reset may have landed after our increment; we hold
                    // WRITER_ACTIVE so the only legitimate value is our token
                    if let Err(e) = sysv::set_value(sem.semid, PENDING, 1) {
                        sem.logger
                            .error(format_args!("semctl restoring writer token: {e}"));
                    }
                }
                Self {
                    sem,
                    valid: true,
                    recovered,
                }
            }
            Err(e) => {
                sem.logger.error(format_args!("semop WriteLock: {e}"));
                Self {
                    sem,
                    valid: false,
                    recovered,
                }
            }
        }
    }

    /// Register `num_readers` outstanding commitments for the data just written.
    pub fn commit_readers(&self, num_readers: usize) -> bool {
        if !self.valid {
            return false;
        }
        if num_readers == 0 {
            // a zero sem_op would wait-for-zero instead of adding nothing
            return true;
        }
        let delta = num_readers.min(MAX_COMMITTED_READERS) as i16;
        let mut ops = [sysv::op(PENDING, delta, 0)];
        match sysv::apply(self.sem.semid, &mut ops) {
            Ok(()) => true,
            Err(e) => {
                self.sem
                    .logger
                    .error(format_args!("semop commit readers: {e}"));
                false
            }
        }
    }

    /// True if mutual exclusion is actually held
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// True if acquisition needed the crash-recovery reset
    pub fn recovered(&self) -> bool {
        self.recovered
    }
}

impl Drop for WriteLock<'_> {
    fn drop(&mut self) {
        if !self.valid {
            return;
        }
        let mut ops = [
            sysv::op(PENDING, -1, NOWAIT),
            sysv::op(WRITER_ACTIVE, -1, NOWAIT),
        ];
        match sysv::apply(self.sem.semid, &mut ops) {
            Ok(()) => {}
            Err(Errno::EAGAIN) => {
                // writer token lost to a forced reset; readers must still be let in
                self.sem
                    .logger
                    .debug(format_args!("semop WriteLock release: writer token already cleared"));
                let mut ops = [sysv::op(WRITER_ACTIVE, -1, NOWAIT)];
                if let Err(e) = sysv::apply(self.sem.semid, &mut ops) {
                    self.sem
                        .logger
                        .error(format_args!("semop WriteLock release: {e}"));
                }
            }
            Err(e) => self
                .sem
                .logger
                .error(format_args!("semop WriteLock release: {e}")),
        }
    }
}
