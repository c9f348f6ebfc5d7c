//! Control-plane wire format
//!
//! Three message shapes travel over the unix socket:
//!
//! ```text
//! server -> client   HandshakePayload  (8232 bytes, little-endian, once)
//! client -> server   HandshakePayload  (same bytes echoed as ack)
//! server -> client   UpdateMessage     (16 bytes, native-endian, repeated)
//! client -> server   QUIT_VALUE        (2 bytes, at voluntary disconnect)
//! ```
//!
//! `UpdateMessage` mirrors a C struct `{ uint16_t type; size_t size; }` on a
//! 64-bit host: type at offset 0, six bytes of padding, size at offset 8.

use crate::error::{ShmError, ShmResult};
use shmdata_common::consts::{HANDSHAKE_MAGIC, MAX_SEGMENT_PATH_LEN, MAX_TYPE_DESCRIPTOR_LEN};
use static_assertions::const_assert_eq;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

/// Size of an encoded [`UpdateMessage`]
pub const UPDATE_MESSAGE_LEN: usize = 16;

const DESCRIPTOR_OFFSET: usize = 40;
const SEGMENT_PATH_OFFSET: usize = DESCRIPTOR_OFFSET + MAX_TYPE_DESCRIPTOR_LEN;

/// Size of an encoded [`HandshakePayload`]
pub const HANDSHAKE_LEN: usize = SEGMENT_PATH_OFFSET + MAX_SEGMENT_PATH_LEN;

const_assert_eq!(HANDSHAKE_LEN, 8232);

/// Value a client sends before leaving voluntarily
pub const QUIT_VALUE: u16 = 1;

/// Size of the encoded quit value
pub const QUIT_LEN: usize = core::mem::size_of::<u16>();

/// Connection progress of one control socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket open, handshake not yet acknowledged
    Connecting,
    /// Handshake done; updates flow
    Connected,
    /// Closed by either side; terminal
    Disconnected,
}

/// Kind of an [`UpdateMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgKind {
    /// A frame of `size` bytes is ready in the segment
    Data = 1,
    /// The writer is going away
    Quit = 2,
}

impl TryFrom<u16> for MsgKind {
    type Error = ShmError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Data),
            2 => Ok(Self::Quit),
            other => Err(ShmError::Protocol(format!("unknown message type {other}"))),
        }
    }
}

/// Server-to-client notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateMessage {
    /// Data or quit
    pub kind: MsgKind,
    /// Frame size in bytes; 0 for quit
    pub size: u64,
}

impl UpdateMessage {
    /// A frame of `size` bytes is ready
    pub fn data(size: usize) -> Self {
        Self {
            kind: MsgKind::Data,
            size: size as u64,
        }
    }

    /// The writer is leaving
    pub fn quit() -> Self {
        Self {
            kind: MsgKind::Quit,
            size: 0,
        }
    }

    /// Wire bytes
    pub fn encode(&self) -> [u8; UPDATE_MESSAGE_LEN] {
        let mut buf = [0u8; UPDATE_MESSAGE_LEN];
        buf[0..2].copy_from_slice(&(self.kind as u16).to_ne_bytes());
        buf[8..16].copy_from_slice(&self.size.to_ne_bytes());
        buf
    }

    /// Parse wire bytes, rejecting unknown kinds
    pub fn decode(buf: &[u8; UPDATE_MESSAGE_LEN]) -> ShmResult<Self> {
        let kind = MsgKind::try_from(u16::from_ne_bytes([buf[0], buf[1]]))?;
        let size = u64::from_ne_bytes(read_array(&buf[8..16]));
        Ok(Self { kind, size })
    }
}

/// What a writer tells each new client about its stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    /// Payload capacity of the segment
    pub capacity: u64,
    /// Segment generation at handshake time
    pub generation: u64,
    /// SysV key of the semaphore set
    pub sem_key: i32,
    /// Process id of the writer
    pub writer_pid: u32,
    /// Producer-chosen type descriptor (caps string)
    pub type_descriptor: String,
    /// Segment file the writer actually mapped
    pub segment_file: PathBuf,
}

impl HandshakePayload {
    /// Check the descriptor fits before the payload is built.
    pub fn check_descriptor(type_descriptor: &str) -> ShmResult<()> {
        if type_descriptor.len() > MAX_TYPE_DESCRIPTOR_LEN {
            return Err(ShmError::DescriptorTooLong {
                len: type_descriptor.len(),
            });
        }
        Ok(())
    }

    /// Check the segment file location fits before the payload is built.
    pub fn check_segment_file(segment_file: &std::path::Path) -> ShmResult<()> {
        let len = segment_file.as_os_str().len();
        if len == 0 || len > MAX_SEGMENT_PATH_LEN {
            return Err(ShmError::SegmentPathTooLong { len });
        }
        Ok(())
    }

    /// Fixed-size wire form, zero-padded after the descriptor and the segment path
    pub fn encode(&self) -> ShmResult<Vec<u8>> {
        Self::check_descriptor(&self.type_descriptor)?;
        Self::check_segment_file(&self.segment_file)?;
        let descr = self.type_descriptor.as_bytes();
        let segment = self.segment_file.as_os_str().as_bytes();

        let mut buf = vec![0u8; HANDSHAKE_LEN];
        buf[0..8].copy_from_slice(&HANDSHAKE_MAGIC);
        buf[8..16].copy_from_slice(&self.capacity.to_le_bytes());
        buf[16..24].copy_from_slice(&self.generation.to_le_bytes());
        buf[24..28].copy_from_slice(&self.sem_key.to_le_bytes());
        buf[28..32].copy_from_slice(&self.writer_pid.to_le_bytes());
        buf[32..36].copy_from_slice(&(descr.len() as u32).to_le_bytes());
        buf[36..40].copy_from_slice(&(segment.len() as u32).to_le_bytes());
        buf[DESCRIPTOR_OFFSET..DESCRIPTOR_OFFSET + descr.len()].copy_from_slice(descr);
        buf[SEGMENT_PATH_OFFSET..SEGMENT_PATH_OFFSET + segment.len()].copy_from_slice(segment);
        Ok(buf)
    }

    /// Parse and validate a received handshake
    pub fn decode(buf: &[u8]) -> ShmResult<Self> {
        if buf.len() != HANDSHAKE_LEN {
            return Err(ShmError::Protocol(format!(
                "handshake of {} bytes, expected {HANDSHAKE_LEN}",
                buf.len()
            )));
        }
        if buf[0..8] != HANDSHAKE_MAGIC {
            return Err(ShmError::Protocol("bad handshake magic".to_string()));
        }

        let descr_len = u32::from_le_bytes(read_array(&buf[32..36])) as usize;
        if descr_len > MAX_TYPE_DESCRIPTOR_LEN {
            return Err(ShmError::DescriptorTooLong { len: descr_len });
        }
        let type_descriptor =
            std::str::from_utf8(&buf[DESCRIPTOR_OFFSET..DESCRIPTOR_OFFSET + descr_len])
                .map_err(|e| ShmError::Protocol(format!("type descriptor is not utf-8: {e}")))?
                .to_string();

        let segment_len = u32::from_le_bytes(read_array(&buf[36..40])) as usize;
        if segment_len == 0 || segment_len > MAX_SEGMENT_PATH_LEN {
            return Err(ShmError::SegmentPathTooLong { len: segment_len });
        }
        let segment_file = PathBuf::from(OsStr::from_bytes(
            &buf[SEGMENT_PATH_OFFSET..SEGMENT_PATH_OFFSET + segment_len],
        ));

        Ok(Self {
            capacity: u64::from_le_bytes(read_array(&buf[8..16])),
            generation: u64::from_le_bytes(read_array(&buf[16..24])),
            sem_key: i32::from_le_bytes(read_array(&buf[24..28])),
            writer_pid: u32::from_le_bytes(read_array(&buf[28..32])),
            type_descriptor,
            segment_file,
        })
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
