//! Consumer end of a stream
//!
//! A [`Reader`] connects to the writer's control socket; its I/O thread turns
//! every `Data` notification into a guarded [`FrameHandler::on_data`] call:
//!
//! ```text
//! Data{size} -> ReadLock (waits while a writer is active)
//!            -> remap if the writer resized
//!            -> on_data(&segment[..size])
//!            -> release: one commitment consumed
//! ```
//!
//! `on_data` runs while the commitment is held, so its duration delays the
//! writer's next frame. Keep it short and non-blocking; the writer stops
//! waiting after the crash-recovery timeout.

use crate::logger::{Logger, default_logger};
use crate::protocol::HandshakePayload;
use crate::segment::SegmentView;
use crate::sem::SemaphoreSet;
use crate::socket::client::ClientTimeouts;
use crate::socket::{ClientHandler, SocketClient};
use shmdata_common::config::TransportConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// User callbacks of a [`Reader`] or [`Follower`](crate::Follower)
///
/// All of them run on the reader's I/O thread.
pub trait FrameHandler: Send + Sync + 'static {
    /// A frame is ready. `data` is only valid for the duration of the call.
    fn on_data(&self, data: &[u8]);

    /// Handshake done; `type_descriptor` is the writer's caps string.
    fn on_connect(&self, _type_descriptor: &str) {}

    /// The writer went away.
    fn on_disconnect(&self) {}
}

impl<F> FrameHandler for F
where
    F: Fn(&[u8]) + Send + Sync + 'static,
{
    fn on_data(&self, data: &[u8]) {
        self(data)
    }
}

type DataFn = Box<dyn Fn(&[u8]) + Send + Sync>;
type ConnectFn = Box<dyn Fn(&str) + Send + Sync>;
type DisconnectFn = Box<dyn Fn() + Send + Sync>;

/// Closure-based [`FrameHandler`]
pub struct Callbacks {
    on_data: DataFn,
    on_connect: Option<ConnectFn>,
    on_disconnect: Option<DisconnectFn>,
}

impl Callbacks {
    /// Handler running `on_data` for every frame
    pub fn new(on_data: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        Self {
            on_data: Box::new(on_data),
            on_connect: None,
            on_disconnect: None,
        }
    }

    /// Also run `f` with the type descriptor after each handshake
    pub fn on_connect(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Box::new(f));
        self
    }

    /// Also run `f` when the writer goes away
    pub fn on_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Box::new(f));
        self
    }
}

impl FrameHandler for Callbacks {
    fn on_data(&self, data: &[u8]) {
        (self.on_data)(data)
    }

    fn on_connect(&self, type_descriptor: &str) {
        if let Some(f) = &self.on_connect {
            f(type_descriptor)
        }
    }

    fn on_disconnect(&self) {
        if let Some(f) = &self.on_disconnect {
            f()
        }
    }
}

/// Client-side state living on the I/O thread
struct ReaderSide {
    sem: Option<SemaphoreSet>,
    view: Option<SegmentView>,
    handler: Arc<dyn FrameHandler>,
    read_timeout: Duration,
    logger: Arc<dyn Logger>,
}

impl ClientHandler for ReaderSide {
    fn prepare(&mut self, handshake: &HandshakePayload) -> bool {
        let sem = match SemaphoreSet::attach(handshake.sem_key, Arc::clone(&self.logger)) {
            Ok(sem) => sem,
            Err(e) => {
                self.logger.debug(format_args!("attaching semaphores: {e}"));
                return false;
            }
        };
        let view = match SegmentView::attach(&handshake.segment_file) {
            Ok(view) => view,
            Err(e) => {
                self.logger.warning(format_args!(
                    "attaching segment {}: {e}",
                    handshake.segment_file.display()
                ));
                return false;
            }
        };

        self.sem = Some(sem);
        self.view = Some(view);
        true
    }

    fn on_connect(&mut self, handshake: &HandshakePayload) {
        self.handler.on_connect(&handshake.type_descriptor);
    }

    fn on_update(&mut self, size: u64) {
        let (Some(sem), Some(view)) = (&self.sem, &mut self.view) else {
            return;
        };

        let lock = sem.read_lock(self.read_timeout);
        if !lock.is_valid() {
            return;
        }
        if let Err(e) = view.refresh() {
            self.logger.error(format_args!("remapping segment: {e}"));
            return;
        }
        self.handler.on_data(view.payload(size as usize));
    }

    fn on_discarded_update(&mut self, _size: u64) {
        if let Some(sem) = &self.sem {
            sem.cancel_committed_reader();
        }
    }

    fn on_disconnect(&mut self) {
        self.handler.on_disconnect();
    }
}

/// Consumer attached to one writer
pub struct Reader {
    client: SocketClient,
    path: PathBuf,
}

impl Reader {
    /// Connect to the writer at `path` with default configuration and logger.
    pub fn new(path: impl AsRef<Path>, handler: Arc<dyn FrameHandler>) -> Self {
        Self::new_with_config(path, handler, &TransportConfig::default(), default_logger())
    }

    /// Connect to the writer at `path`.
    ///
    /// Never fails: check [`Reader::is_valid`]. No writer at `path` is an
    /// expected condition and is only logged at debug level.
    pub fn new_with_config(
        path: impl AsRef<Path>,
        handler: Arc<dyn FrameHandler>,
        config: &TransportConfig,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let path = path.as_ref().to_path_buf();
        let side = ReaderSide {
            sem: None,
            view: None,
            handler,
            read_timeout: config.crash_recovery_timeout(),
            logger: Arc::clone(&logger),
        };
        let timeouts = ClientTimeouts {
            poll_interval: config.socket_poll_interval(),
            handshake: config.handshake_timeout(),
        };
        let client = SocketClient::connect(&path, Box::new(side), timeouts, logger);
        Self { client, path }
    }

    /// True while connected to a live writer
    pub fn is_valid(&self) -> bool {
        self.client.is_valid()
    }

    /// Identity path
    pub fn path(&self) -> &Path {
        &self.path
    }
}
