//! Writer side of the control plane
//!
//! One I/O thread multiplexes the listening socket and every accepted client
//! with `poll(2)`. Each client goes through:
//!
//! ```text
//! accept -> send handshake -> Connecting -> echo matches -> Connected -> quit/EOF -> removed
//! ```
//!
//! Only `Connected` clients receive broadcasts. Writes happen on the caller's
//! thread through a cloned descriptor kept in the shared client table, so the
//! I/O thread never touches the write path.

use super::poll_timeout;
use crate::error::{ShmError, ShmResult};
use crate::logger::Logger;
use crate::protocol::{ConnectionState, QUIT_LEN, QUIT_VALUE, UpdateMessage};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Write half of an accepted client, shared with `broadcast`
struct ClientSlot {
    stream: UnixStream,
    state: ConnectionState,
}

/// Read half of an accepted client, owned by the I/O thread
struct Connection {
    stream: UnixStream,
    sent: Vec<u8>,
    buf: Vec<u8>,
    connected: bool,
}

struct ServerShared {
    quit: AtomicBool,
    clients: Mutex<HashMap<u64, ClientSlot>>,
    handshake: Mutex<Vec<u8>>,
    write_timeout: Duration,
    logger: Arc<dyn Logger>,
}

/// Listening control socket of a writer
pub struct SocketServer {
    path: PathBuf,
    shared: Arc<ServerShared>,
    io_thread: Option<JoinHandle<()>>,
}

impl SocketServer {
    /// Bind `path` and start serving `handshake` to every new client.
    pub fn bind(
        path: &Path,
        handshake: Vec<u8>,
        poll_interval: Duration,
        write_timeout: Duration,
        logger: Arc<dyn Logger>,
    ) -> ShmResult<Self> {
        let listener = UnixListener::bind(path).map_err(|e| match e.kind() {
            ErrorKind::AddrInUse => ShmError::AlreadyOwned {
                path: path.to_path_buf(),
            },
            _ => ShmError::Io { source: e },
        })?;
        listener.set_nonblocking(true)?;

        let shared = Arc::new(ServerShared {
            quit: AtomicBool::new(false),
            clients: Mutex::new(HashMap::new()),
            handshake: Mutex::new(handshake),
            write_timeout,
            logger,
        });

        let thread_shared = Arc::clone(&shared);
        let io_thread = std::thread::Builder::new()
            .name("shmdata-server".to_string())
            .spawn(move || serve(listener, thread_shared, poll_interval));
        let io_thread = match io_thread {
            Ok(handle) => handle,
            Err(e) => {
                let _ = std::fs::remove_file(path);
                return Err(e.into());
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            shared,
            io_thread: Some(io_thread),
        })
    }

    /// Socket path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send `msg` to every connected client. Returns how many received it.
    ///
    /// A client whose write fails is shut down and will be reaped by the I/O thread.
    pub fn broadcast(&self, msg: UpdateMessage) -> usize {
        let bytes = msg.encode();
        let mut clients = self.shared.clients.lock();
        let mut sent = 0;
        for (id, slot) in clients.iter_mut() {
            if slot.state != ConnectionState::Connected {
                continue;
            }
            match (&slot.stream).write_all(&bytes) {
                Ok(()) => sent += 1,
                Err(e) => {
                    self.shared
                        .logger
                        .debug(format_args!("dropping client {id}: {e}"));
                    slot.state = ConnectionState::Disconnected;
                    let _ = slot.stream.shutdown(Shutdown::Both);
                }
            }
        }
        sent
    }

    /// Clients that completed the handshake
    pub fn num_connected(&self) -> usize {
        self.shared
            .clients
            .lock()
            .values()
            .filter(|slot| slot.state == ConnectionState::Connected)
            .count()
    }

    /// Accepted clients, whether or not their handshake completed
    pub fn num_clients(&self) -> usize {
        self.shared.clients.lock().len()
    }

    /// Replace the handshake sent to clients accepted from now on.
    pub fn set_handshake(&self, handshake: Vec<u8>) {
        *self.shared.handshake.lock() = handshake;
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.shared.quit.store(true, Ordering::Release);
        let _ = std::fs::remove_file(&self.path);
        self.broadcast(UpdateMessage::quit());

        if let Some(handle) = self.io_thread.take() {
            if handle.join().is_err() {
                self.shared
                    .logger
                    .error(format_args!("control socket thread panicked"));
            }
        }

        for (_, slot) in self.shared.clients.lock().drain() {
            let _ = slot.stream.shutdown(Shutdown::Both);
        }
    }
}

fn serve(listener: UnixListener, shared: Arc<ServerShared>, poll_interval: Duration) {
    let timeout = poll_timeout(poll_interval);
    let mut connections: HashMap<u64, Connection> = HashMap::new();
    let mut next_id: u64 = 0;

    while !shared.quit.load(Ordering::Acquire) {
        let ids: Vec<u64> = connections.keys().copied().collect();
        let (accept_ready, ready) = {
            let mut fds = Vec::with_capacity(ids.len() + 1);
            fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
            fds.extend(
                ids.iter()
                    .map(|id| PollFd::new(connections[id].stream.as_fd(), PollFlags::POLLIN)),
            );

            match poll(&mut fds, timeout) {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => {}
                Err(e) => {
                    shared
                        .logger
                        .error(format_args!("poll on control socket: {e}"));
                    break;
                }
            }

            let is_ready = |fd: &PollFd| fd.revents().is_some_and(|r| !r.is_empty());
            let ready: Vec<u64> = ids
                .iter()
                .zip(&fds[1..])
                .filter(|(_, fd)| is_ready(fd))
                .map(|(id, _)| *id)
                .collect();
            (is_ready(&fds[0]), ready)
        };

        if accept_ready {
            loop {
                match listener.accept() {
                    Ok((stream, _)) => {
                        next_id += 1;
                        if let Some(conn) = shared.register(next_id, stream) {
                            connections.insert(next_id, conn);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        shared.logger.error(format_args!("accept: {e}"));
                        break;
                    }
                }
            }
        }

        for id in ready {
            let keep = match connections.get_mut(&id) {
                Some(conn) => shared.service(id, conn),
                None => true,
            };
            if !keep {
                connections.remove(&id);
                shared.clients.lock().remove(&id);
            }
        }
    }
}

impl ServerShared {
    fn register(&self, id: u64, stream: UnixStream) -> Option<Connection> {
        let sent = self.handshake.lock().clone();
        let setup = stream
            .set_write_timeout(Some(self.write_timeout))
            .and_then(|_| stream.try_clone())
            .and_then(|write_half| {
                send_handshake(&stream, &sent)?;
                Ok(write_half)
            });

        match setup {
            Ok(write_half) => {
                self.clients.lock().insert(
                    id,
                    ClientSlot {
                        stream: write_half,
                        state: ConnectionState::Connecting,
                    },
                );
                self.logger
                    .debug(format_args!("client {id} accepted, handshake sent"));
                Some(Connection {
                    stream,
                    sent,
                    buf: Vec::new(),
                    connected: false,
                })
            }
            Err(e) => {
                self.logger
                    .debug(format_args!("client {id} handshake failed: {e}"));
                None
            }
        }
    }

    /// Consume readable bytes from one client. Returns false to drop it.
    fn service(&self, id: u64, conn: &mut Connection) -> bool {
        let mut chunk = [0u8; 4096];
        let n = match (&conn.stream).read(&mut chunk) {
            Ok(0) => {
                self.logger.debug(format_args!("client {id} closed"));
                return false;
            }
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                return true;
            }
            Err(e) => {
                self.logger.debug(format_args!("client {id} read: {e}"));
                return false;
            }
        };
        conn.buf.extend_from_slice(&chunk[..n]);

        loop {
            if !conn.connected {
                if conn.buf.len() < conn.sent.len() {
                    return true;
                }
                if conn.buf[..conn.sent.len()] != conn.sent[..] {
                    self.logger
                        .debug(format_args!("client {id} echoed a different handshake"));
                    return false;
                }
                conn.buf.drain(..conn.sent.len());
                conn.connected = true;
                if let Some(slot) = self.clients.lock().get_mut(&id) {
                    slot.state = ConnectionState::Connected;
                }
                self.logger.debug(format_args!("client {id} connected"));
                continue;
            }

            if conn.buf.len() < QUIT_LEN {
                return true;
            }
            let value = u16::from_ne_bytes([conn.buf[0], conn.buf[1]]);
            conn.buf.drain(..QUIT_LEN);
            if value == QUIT_VALUE {
                self.logger.debug(format_args!("client {id} quit"));
            } else {
                self.logger
                    .debug(format_args!("client {id} sent unexpected value {value}"));
            }
            return false;
        }
    }
}

fn send_handshake(stream: &UnixStream, payload: &[u8]) -> std::io::Result<()> {
    let mut stream = stream;
    stream.write_all(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MsgKind, UPDATE_MESSAGE_LEN};
    use std::time::Instant;

    const POLL: Duration = Duration::from_millis(10);

    fn server(dir: &tempfile::TempDir, handshake: &[u8]) -> SocketServer {
        SocketServer::bind(
            &dir.path().join("ctl"),
            handshake.to_vec(),
            POLL,
            Duration::from_secs(1),
            crate::logger::default_logger(),
        )
        .unwrap()
    }

    fn handshake_client(path: &Path, len: usize) -> UnixStream {
        let mut stream = UnixStream::connect(path).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let mut hs = vec![0u8; len];
        stream.read_exact(&mut hs).unwrap();
        stream.write_all(&hs).unwrap();
        stream
    }

    fn wait_connected(server: &SocketServer, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while server.num_connected() != n {
            assert!(Instant::now() < deadline, "clients never connected");
            std::thread::sleep(POLL);
        }
    }

    #[test]
    fn test_broadcast_reaches_connected_clients_only() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(&dir, b"hello-handshake");

        let mut a = handshake_client(server.path(), 15);
        // accepted but never acknowledges
        let _pending = UnixStream::connect(server.path()).unwrap();
        wait_connected(&server, 1);

        assert_eq!(server.broadcast(UpdateMessage::data(42)), 1);
        let mut buf = [0u8; UPDATE_MESSAGE_LEN];
        a.read_exact(&mut buf).unwrap();
        let msg = UpdateMessage::decode(&buf).unwrap();
        assert_eq!(msg.kind, MsgKind::Data);
        assert_eq!(msg.size, 42);
    }

    #[test]
    fn test_quit_value_deregisters_client() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(&dir, b"hs");
        let mut a = handshake_client(server.path(), 2);
        let _b = handshake_client(server.path(), 2);
        wait_connected(&server, 2);

        a.write_all(&QUIT_VALUE.to_ne_bytes()).unwrap();
        wait_connected(&server, 1);
        assert_eq!(server.broadcast(UpdateMessage::data(1)), 1);
    }

    #[test]
    fn test_wrong_echo_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(&dir, b"abcd");
        let mut stream = UnixStream::connect(server.path()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let mut hs = [0u8; 4];
        stream.read_exact(&mut hs).unwrap();
        stream.write_all(b"abcX").unwrap();

        // server closes the connection
        let mut rest = [0u8; 1];
        assert_eq!(stream.read(&mut rest).unwrap(), 0);
        assert_eq!(server.num_connected(), 0);
    }

    #[test]
    fn test_drop_sends_quit_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(&dir, b"hs");
        let path = server.path().to_path_buf();
        let mut a = handshake_client(&path, 2);
        wait_connected(&server, 1);

        drop(server);
        assert!(!path.exists());
        let mut buf = [0u8; UPDATE_MESSAGE_LEN];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(UpdateMessage::decode(&buf).unwrap().kind, MsgKind::Quit);
    }

    #[test]
    fn test_bind_twice_is_already_owned() {
        let dir = tempfile::tempdir().unwrap();
        let _server = server(&dir, b"hs");
        let second = SocketServer::bind(
            &dir.path().join("ctl"),
            b"hs".to_vec(),
            POLL,
            Duration::from_secs(1),
            crate::logger::default_logger(),
        );
        assert!(matches!(second, Err(ShmError::AlreadyOwned { .. })));
    }
}
