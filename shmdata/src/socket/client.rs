//! Reader side of the control plane
//!
//! A refused connection is the normal "producer not running yet" case: the
//! client comes back invalid, no thread is spawned and nothing is logged above
//! debug. Once connected, a dedicated I/O thread performs the handshake and
//! then turns each notification into a [`ClientHandler`] call.
//!
//! The handshake is only echoed after [`ClientHandler::prepare`] accepted it,
//! so the writer never counts a client that could not map its segment. Any
//! failure before the echo shuts the socket down.

use super::poll_timeout;
use crate::error::{ShmError, ShmResult};
use crate::logger::Logger;
use crate::protocol::{
    ConnectionState, HANDSHAKE_LEN, HandshakePayload, MsgKind, QUIT_VALUE, UPDATE_MESSAGE_LEN,
    UpdateMessage,
};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::{Condvar, Mutex};
use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Callbacks run on the client's I/O thread
pub trait ClientHandler: Send + 'static {
    /// Handshake received, not yet echoed. Returning false abandons the
    /// connection before the writer registers it.
    fn prepare(&mut self, handshake: &HandshakePayload) -> bool;

    /// Handshake echoed; notifications may follow.
    fn on_connect(&mut self, handshake: &HandshakePayload);

    /// The writer published a frame of `size` bytes.
    fn on_update(&mut self, size: u64);

    /// A frame notification arrived after teardown began.
    fn on_discarded_update(&mut self, _size: u64) {}

    /// The connection ended without the client asking for it. Called at most once.
    fn on_disconnect(&mut self);
}

struct ClientShared {
    quit: AtomicBool,
    state: Mutex<ConnectionState>,
    state_changed: Condvar,
}

impl ClientShared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        self.state_changed.notify_all();
    }
}

/// Timeouts of one client connection
#[derive(Debug, Clone, Copy)]
pub struct ClientTimeouts {
    /// Readiness-poll timeout of the I/O loop
    pub poll_interval: Duration,
    /// Bound on the handshake exchange and on teardown draining
    pub handshake: Duration,
}

/// Connection to a writer's control socket
pub struct SocketClient {
    shared: Arc<ClientShared>,
    stream: Option<UnixStream>,
    io_thread: Option<JoinHandle<()>>,
    logger: Arc<dyn Logger>,
}

impl SocketClient {
    /// Connect to `path` and wait for the handshake to complete.
    pub fn connect(
        path: &Path,
        handler: Box<dyn ClientHandler>,
        timeouts: ClientTimeouts,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let shared = Arc::new(ClientShared {
            quit: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::Connecting),
            state_changed: Condvar::new(),
        });

        let stream = match Self::open(path, &logger) {
            Ok(stream) => stream,
            Err(_) => {
                shared.set_state(ConnectionState::Disconnected);
                return Self {
                    shared,
                    stream: None,
                    io_thread: None,
                    logger,
                };
            }
        };

        let spawned = stream.try_clone().and_then(|read_half| {
            let thread_shared = Arc::clone(&shared);
            let thread_logger = Arc::clone(&logger);
            std::thread::Builder::new()
                .name("shmdata-client".to_string())
                .spawn(move || {
                    run(read_half, handler, &thread_shared, timeouts, &*thread_logger);
                    thread_shared.set_state(ConnectionState::Disconnected);
                })
        });

        let io_thread = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                logger.error(format_args!("spawning control client thread: {e}"));
                shared.set_state(ConnectionState::Disconnected);
                None
            }
        };

        {
            let mut state = shared.state.lock();
            shared.state_changed.wait_while_for(
                &mut state,
                |state| *state == ConnectionState::Connecting,
                timeouts.handshake + timeouts.poll_interval,
            );
        }

        Self {
            shared,
            stream: Some(stream),
            io_thread,
            logger,
        }
    }

    fn open(path: &Path, logger: &Arc<dyn Logger>) -> ShmResult<UnixStream> {
        UnixStream::connect(path).map_err(|e| {
            match e.kind() {
                ErrorKind::ConnectionRefused | ErrorKind::NotFound => logger.debug(format_args!(
                    "no producer at {}: {e}",
                    path.display()
                )),
                _ => logger.error(format_args!("connecting to {}: {e}", path.display())),
            }
            ShmError::Io { source: e }
        })
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// True while the handshake is done and the writer has not gone away
    pub fn is_valid(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.shared.quit.store(true, Ordering::Release);

        if let Some(stream) = &self.stream {
            if self.is_valid() {
                let mut writer = stream;
                if let Err(e) = writer.write_all(&QUIT_VALUE.to_ne_bytes()) {
                    self.logger
                        .debug(format_args!("sending quit to writer: {e}"));
                }
            } else {
                // unblock a handshake still in flight
                let _ = stream.shutdown(Shutdown::Both);
            }
        }

        if let Some(handle) = self.io_thread.take() {
            if handle.join().is_err() {
                self.logger
                    .error(format_args!("control client thread panicked"));
            }
        }
    }
}

fn run(
    mut stream: UnixStream,
    mut handler: Box<dyn ClientHandler>,
    shared: &ClientShared,
    timeouts: ClientTimeouts,
    logger: &dyn Logger,
) {
    let (raw, payload) = match receive_handshake(&mut stream, timeouts.handshake) {
        Ok(received) => received,
        Err(e) => {
            logger.debug(format_args!("handshake failed: {e}"));
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    };
    if !handler.prepare(&payload) {
        logger.debug(format_args!("handshake rejected by handler"));
        let _ = stream.shutdown(Shutdown::Both);
        return;
    }
    if let Err(e) = stream.write_all(&raw) {
        logger.debug(format_args!("echoing handshake: {e}"));
        let _ = stream.shutdown(Shutdown::Both);
        return;
    }
    handler.on_connect(&payload);
    shared.set_state(ConnectionState::Connected);

    let timeout = poll_timeout(timeouts.poll_interval);
    loop {
        if shared.quit.load(Ordering::Acquire) {
            drain(&mut stream, &mut *handler, timeouts.handshake);
            return;
        }

        match wait_readable(&stream, timeout) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                logger.error(format_args!("poll on control socket: {e}"));
                break;
            }
        }

        match read_update(&mut stream) {
            Ok(UpdateMessage {
                kind: MsgKind::Data,
                size,
            }) => {
                if shared.quit.load(Ordering::Acquire) {
                    handler.on_discarded_update(size);
                } else {
                    handler.on_update(size);
                }
            }
            Ok(UpdateMessage {
                kind: MsgKind::Quit,
                ..
            }) => {
                logger.debug(format_args!("writer quit"));
                break;
            }
            Err(e) => {
                logger.debug(format_args!("control socket closed: {e}"));
                break;
            }
        }
    }

    shared.set_state(ConnectionState::Disconnected);
    if !shared.quit.load(Ordering::Acquire) {
        handler.on_disconnect();
    }
}

fn receive_handshake(
    stream: &mut UnixStream,
    timeout: Duration,
) -> ShmResult<(Vec<u8>, HandshakePayload)> {
    stream.set_read_timeout(Some(timeout))?;
    let mut buf = vec![0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf)?;
    let payload = HandshakePayload::decode(&buf)?;
    Ok((buf, payload))
}

fn wait_readable(stream: &UnixStream, timeout: PollTimeout) -> Result<bool, Errno> {
    let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, timeout) {
        Ok(0) | Err(Errno::EINTR) => Ok(false),
        Ok(_) => Ok(true),
        Err(e) => Err(e),
    }
}

fn read_update(stream: &mut UnixStream) -> ShmResult<UpdateMessage> {
    let mut buf = [0u8; UPDATE_MESSAGE_LEN];
    stream.read_exact(&mut buf)?;
    UpdateMessage::decode(&buf)
}

/// Hand every notification still queued to `on_discarded_update` until the
/// writer closes the connection or `limit` elapses.
fn drain(stream: &mut UnixStream, handler: &mut dyn ClientHandler, limit: Duration) {
    let deadline = Instant::now() + limit;
    let timeout = poll_timeout(Duration::from_millis(10));
    while Instant::now() < deadline {
        match wait_readable(stream, timeout) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(_) => return,
        }
        match read_update(stream) {
            Ok(UpdateMessage {
                kind: MsgKind::Data,
                size,
            }) => handler.on_discarded_update(size),
            _ => return,
        }
    }
}
