//! Reconnecting reader
//!
//! ```text
//!            socket appears, handshake ok
//! Monitoring ----------------------------> Attached
//!     ^                                       |
//!     +---------------------------------------+
//!         writer quit or crashed: on_disconnect, monitor restarted
//! ```
//!
//! The monitor thread only runs while `Monitoring`. A dead reader is dropped by
//! the next monitor, never from its own I/O thread (dropping joins that thread).
//!
//! User callbacks run under the read side of a gate that `Drop` closes first,
//! so none starts once dropping began and a running one is waited for.

use crate::logger::{Logger, default_logger};
use crate::platform::is_unix_socket;
use crate::reader::{FrameHandler, Reader};
use parking_lot::{Mutex, RwLock};
use shmdata_common::config::TransportConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Where a [`Follower`] currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerState {
    /// Waiting for a writer to appear
    Monitoring,
    /// Connected to a live writer
    Attached,
}

struct FollowerShared {
    path: PathBuf,
    handler: Arc<dyn FrameHandler>,
    config: TransportConfig,
    logger: Arc<dyn Logger>,
    quit: AtomicBool,
    callbacks_open: RwLock<bool>,
    reader: Mutex<Option<Reader>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Forwards callbacks and restarts monitoring on disconnect
struct Link {
    handler: Arc<dyn FrameHandler>,
    shared: Weak<FollowerShared>,
}

impl Link {
    /// Run `f` unless the follower is being dropped. Returns whether it ran.
    fn gated(&self, shared: &FollowerShared, f: impl FnOnce(&dyn FrameHandler)) -> bool {
        let open = shared.callbacks_open.read();
        if !*open {
            return false;
        }
        f(&*self.handler);
        true
    }
}

impl FrameHandler for Link {
    fn on_data(&self, data: &[u8]) {
        if let Some(shared) = self.shared.upgrade() {
            self.gated(&shared, |handler| handler.on_data(data));
        }
    }

    fn on_connect(&self, type_descriptor: &str) {
        if let Some(shared) = self.shared.upgrade() {
            self.gated(&shared, |handler| handler.on_connect(type_descriptor));
        }
    }

    fn on_disconnect(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if self.gated(&shared, |handler| handler.on_disconnect()) {
            spawn_monitor(&shared);
        }
    }
}

/// Reader that survives writer absence, crash and restart
pub struct Follower {
    shared: Arc<FollowerShared>,
}

impl Follower {
    /// Follow `path` with default configuration and logger.
    pub fn new(path: impl AsRef<Path>, handler: Arc<dyn FrameHandler>) -> Self {
        Self::new_with_config(path, handler, &TransportConfig::default(), default_logger())
    }

    /// Follow `path`. Returns immediately; attaching happens in the background.
    pub fn new_with_config(
        path: impl AsRef<Path>,
        handler: Arc<dyn FrameHandler>,
        config: &TransportConfig,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let shared = Arc::new(FollowerShared {
            path: path.as_ref().to_path_buf(),
            handler,
            config: config.clone(),
            logger,
            quit: AtomicBool::new(false),
            callbacks_open: RwLock::new(true),
            reader: Mutex::new(None),
            monitor: Mutex::new(None),
        });
        spawn_monitor(&shared);
        Self { shared }
    }

    /// Monitoring or attached
    pub fn state(&self) -> FollowerState {
        match &*self.shared.reader.lock() {
            Some(reader) if reader.is_valid() => FollowerState::Attached,
            _ => FollowerState::Monitoring,
        }
    }

    /// Followed path
    pub fn path(&self) -> &Path {
        &self.shared.path
    }
}

impl Drop for Follower {
    fn drop(&mut self) {
        // waits for a callback already running
        *self.shared.callbacks_open.write() = false;
        self.shared
            .logger
            .debug(format_args!("stopped following {}", self.shared.path.display()));

        {
            // no monitor may be spawned once this is set
            let _monitor = self.shared.monitor.lock();
            self.shared.quit.store(true, Ordering::Release);
        }
        join_monitor(&self.shared);

        let reader = self.shared.reader.lock().take();
        drop(reader);

        // a disconnect racing with teardown may have spawned one before quit was set
        join_monitor(&self.shared);
    }
}

fn join_monitor(shared: &FollowerShared) {
    let handle = shared.monitor.lock().take();
    if let Some(handle) = handle {
        if handle.join().is_err() {
            shared
                .logger
                .error(format_args!("follower monitor thread panicked"));
        }
    }
}

fn spawn_monitor(shared: &Arc<FollowerShared>) {
    let mut monitor = shared.monitor.lock();
    if shared.quit.load(Ordering::Acquire) {
        return;
    }
    if let Some(previous) = monitor.take() {
        // finishes on its own once it stored its reader
        let _ = previous.join();
    }

    let thread_shared = Arc::clone(shared);
    match std::thread::Builder::new()
        .name("shmdata-follower".to_string())
        .spawn(move || run_monitor(&thread_shared))
    {
        Ok(handle) => *monitor = Some(handle),
        Err(e) => shared
            .logger
            .error(format_args!("spawning follower monitor: {e}")),
    }
}

fn run_monitor(shared: &Arc<FollowerShared>) {
    let dead = shared.reader.lock().take();
    drop(dead);

    let interval = shared.config.follower_poll_interval();
    while !shared.quit.load(Ordering::Acquire) {
        if is_unix_socket(&shared.path) {
            let link = Link {
                handler: Arc::clone(&shared.handler),
                shared: Arc::downgrade(shared),
            };
            let reader = Reader::new_with_config(
                &shared.path,
                Arc::new(link),
                &shared.config,
                Arc::clone(&shared.logger),
            );
            if reader.is_valid() {
                let mut slot = shared.reader.lock();
                if shared.quit.load(Ordering::Acquire) {
                    return;
                }
                shared
                    .logger
                    .debug(format_args!("following {}", shared.path.display()));
                *slot = Some(reader);
                return;
            }
        }
        std::thread::sleep(interval);
    }
}
