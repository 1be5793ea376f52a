//! Stream multiplexing frames.
//!
//! Every record on a connection is a 4-byte big-endian length followed by a
//! body. After the handshake each body (once unsealed) is one frame:
//!
//! ```text
//! +------+----------------+-----------------+
//! | kind | stream id (BE) | payload ...     |
//! | 1 B  | 4 B            | 0..MAX_PAYLOAD  |
//! +------+----------------+-----------------+
//! ```
//!
//! Each stream direction is flow controlled: a sender may have at most
//! [`STREAM_WINDOW`] unacknowledged bytes in flight, and the receiver grants
//! more with `Window` frames as its reader consumes data.

use crate::error::{WireError, WireResult};
use bytes::Bytes;

/// Largest payload carried by one frame; longer writes are split.
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Largest record body accepted off the wire (payload + header + AEAD tag).
pub const MAX_RECORD_SIZE: usize = MAX_PAYLOAD + 64;

/// Receive window per stream direction.
pub const STREAM_WINDOW: u32 = 256 * 1024;

const HEADER_LEN: usize = 5;

/// Frame variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Open a stream; payload is the protocol name.
    Open = 1,
    /// The protocol in the matching `Open` is supported.
    Ack = 2,
    /// Stream bytes.
    Data = 3,
    /// Sender will write no more on this stream.
    Close = 4,
    /// Abort the stream in both directions.
    Reset = 5,
    /// Grant the sender more credit; payload is a 4-byte big-endian count.
    Window = 6,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Open,
            2 => Self::Ack,
            3 => Self::Data,
            4 => Self::Close,
            5 => Self::Reset,
            6 => Self::Window,
            other => return Err(WireError::InvalidFrame(format!("unknown kind {other}"))),
        })
    }
}

/// One multiplexed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            stream_id,
            payload: payload.into(),
        }
    }

    /// A frame with no payload.
    pub fn control(kind: FrameKind, stream_id: u32) -> Self {
        Self::new(kind, stream_id, Bytes::new())
    }

    /// A `Window` frame granting `credit` more bytes on `stream_id`.
    pub fn window(stream_id: u32, credit: u32) -> Self {
        Self::new(
            FrameKind::Window,
            stream_id,
            Bytes::copy_from_slice(&credit.to_be_bytes()),
        )
    }

    /// The credit carried by a `Window` frame.
    pub fn credit(&self) -> Option<u32> {
        if self.kind != FrameKind::Window {
            return None;
        }
        let bytes: [u8; 4] = self.payload[..].try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Serialize to a record body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.stream_id.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a record body.
    pub fn decode(body: &[u8]) -> WireResult<Self> {
        if body.len() < HEADER_LEN {
            return Err(WireError::InvalidFrame(format!(
                "frame of {} bytes is shorter than its header",
                body.len()
            )));
        }
        let kind = FrameKind::try_from(body[0])?;
        let stream_id = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
        let payload = &body[HEADER_LEN..];
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::MessageTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        if !payload.is_empty() && !matches!(
            kind,
            FrameKind::Open | FrameKind::Data | FrameKind::Reset | FrameKind::Window
        ) {
            return Err(WireError::InvalidFrame(format!(
                "{kind:?} frame must not carry a payload"
            )));
        }
        if kind == FrameKind::Window && payload.len() != 4 {
            return Err(WireError::InvalidFrame(format!(
                "window frame carries {} bytes, expected 4",
                payload.len()
            )));
        }
        Ok(Self {
            kind,
            stream_id,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// Prefix `body` with its 4-byte big-endian length.
pub fn encode_record(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> usize {
    u32::from_be_bytes(*header) as usize
}
