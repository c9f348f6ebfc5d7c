//! # shmdata
//!
//! Shared memory frame transport: one writer publishes variable-size frames
//! to any number of reader processes through a memory-mapped segment, while a
//! unix-domain socket carries the low-bandwidth control traffic.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────┐  Data{size} / Quit   ┌─────────────────┐
//! │     Writer      ├─────────────────────►│     Reader      │
//! │  SocketServer   │◄─────────────────────┤  SocketClient   │
//! │                 │  handshake echo/quit │                 │
//! └───────┬─────────┘                      └────────┬────────┘
//!         │ WriteLock                        ReadLock│
//!         ▼                                          ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │ SysV semaphores: PENDING (commitments) + WRITER_ACTIVE     │
//! ├────────────────────────────────────────────────────────────┤
//! │ Segment file: [64-byte header | payload]                   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! - The writer copies a frame under its `WriteLock`, broadcasts `Data{size}`
//!   to every connected reader and commits that many reads.
//! - Each reader takes a `ReadLock`, runs its `on_data` callback on the
//!   mapped bytes and releases one commitment.
//! - The next `WriteLock` waits for all commitments. A reader that crashed
//!   mid-read costs the writer at most the crash-recovery timeout (1 s).
//!
//! A [`Follower`] wraps a [`Reader`] and re-attaches across writer absence,
//! crash and restart.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shmdata::{Follower, Writer};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let _follower = Follower::new("/tmp/video", Arc::new(|frame: &[u8]| {
//!     println!("got {} bytes", frame.len());
//! }));
//!
//! let mut writer = Writer::create("/tmp/video", 1024, "video/x-raw")?;
//! writer.copy_to_shm(b"frame bytes");
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Only [`Writer::create`] returns a `Result`. Everything past construction
//! reports through validity flags and callbacks:
//!
//! - A reader with no writer present is simply invalid.
//! - A socket failure surfaces as `on_disconnect`.
//! - A failed write reports `false` from [`Writer::copy_to_shm`].
//!
//! Diagnostics go to an injectable [`Logger`], by default `tracing`.
//!
//! ## Platform Support
//!
//! Linux only: SysV semaphores, file-backed `mmap` and unix-domain sockets.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod discovery;
pub mod error;
pub mod follower;
pub mod lifecycle;
pub mod logger;
pub mod platform;
pub mod protocol;
pub mod reader;
pub mod segment;
pub mod sem;
pub mod socket;
pub mod writer;

pub use discovery::{DiscoveryStats, SegmentDiscovery, SegmentInfo};
pub use error::{ShmError, ShmResult};
pub use follower::{Follower, FollowerState};
pub use logger::{Logger, TracingLogger, default_logger};
pub use protocol::{ConnectionState, HandshakePayload, MsgKind, UpdateMessage};
pub use reader::{Callbacks, FrameHandler, Reader};
pub use segment::{HEADER_SIZE, SegmentHeader};
pub use sem::{Ownership, ReadLock, SemaphoreSet, WriteLock};
pub use writer::{WriteAccess, Writer};

pub use shmdata_common::config::{LogLevel, TransportConfig};

/// Install a `tracing` subscriber for transport diagnostics.
///
/// `RUST_LOG` wins when set; otherwise events at `level` and above are shown.
pub fn init_tracing(level: LogLevel) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
