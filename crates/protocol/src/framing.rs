//! Length-prefixed frame codec for raw byte transports.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: magic bytes "WTRM"
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload (a MessagePack-encoded [`ClientFrame`] or
//!   [`ServerFrame`](crate::messages::ServerFrame))
//!
//! The codec only delimits payloads; it does not interpret them. Transports
//! with native message boundaries (WebSocket and the like) can skip it and
//! carry encoded frames directly.
//!
//! [`ClientFrame`]: crate::messages::ClientFrame

use crate::error::{ProtocolError, Result};

/// Magic bytes identifying a Webterm frame.
pub const FRAME_MAGIC: [u8; 4] = *b"WTRM";

/// Frame header size: 4 (magic) + 4 (length) = 8 bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum frame size (1 MB). PTY output is chunked well below this; anything
/// larger is a corrupt or hostile stream.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encoder and decoder for length-prefixed frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self
    }

    /// Encode a payload into a framed byte vector.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let total = FRAME_HEADER_SIZE + payload.len();
        if total > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut output = Vec::with_capacity(total);
        output.extend_from_slice(&FRAME_MAGIC);
        output.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        output.extend_from_slice(payload);
        Ok(output)
    }

    /// Decode one frame from the front of `data`.
    ///
    /// Returns the payload and the number of bytes consumed.
    pub fn decode(&self, data: &[u8]) -> Result<(Vec<u8>, usize)> {
        match self.try_decode(data)? {
            Some(result) => Ok(result),
            None => Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame: have {} bytes",
                data.len()
            ))),
        }
    }

    /// Try to decode one frame, returning `None` if `data` holds only a
    /// partial frame so far.
    ///
    /// This is the streaming entry point: callers accumulate bytes from the
    /// transport and call this until it yields a frame, then drop the
    /// consumed prefix.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = &data[0..4];
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::InvalidFrameMagic {
                expected: u32::from_be_bytes(FRAME_MAGIC),
                got: u32::from_be_bytes([magic[0], magic[1], magic[2], magic[3]]),
            });
        }

        let length_bytes: [u8; 4] = data[4..8].try_into().unwrap();
        let payload_len = u32::from_be_bytes(length_bytes) as usize;

        let total = FRAME_HEADER_SIZE + payload_len;
        if total > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: MAX_FRAME_SIZE,
            });
        }

        if data.len() < total {
            return Ok(None);
        }

        Ok(Some((data[FRAME_HEADER_SIZE..total].to_vec(), total)))
    }
}
