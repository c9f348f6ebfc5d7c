//! Unix-domain-socket control plane: handshake, notifications, quit

pub mod client;
pub mod server;

pub use client::{ClientHandler, SocketClient};
pub use server::SocketServer;

use nix::poll::PollTimeout;
use std::time::Duration;

/// Convert a poll interval to a `poll(2)` timeout, saturating at `u16::MAX` ms.
pub(crate) fn poll_timeout(interval: Duration) -> PollTimeout {
    let millis = u16::try_from(interval.as_millis()).unwrap_or(u16::MAX);
    PollTimeout::from(millis)
}
