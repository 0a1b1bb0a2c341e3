//! Frame Protocol
//!
//! Wire format between clients and the daemon: length-prefixed JSON with a
//! CRC32 checksum for integrity verification.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Length (4)     | Checksum (4)   | JSON Payload (variable)                  |
//! | big-endian u32 | CRC32          | Handshake, ClientMessage or ServerMessage|
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! The Length field contains the size of the JSON payload only (not including the checksum).
//! The Checksum is the CRC32 hash of the JSON payload.
//!
//! # Security
//!
//! - Maximum frame size is enforced to prevent memory exhaustion
//! - Length field is validated before allocating buffer
//! - CRC32 checksum detects data corruption in transit

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Maximum frame size (10 MB)
///
/// This prevents memory exhaustion from malicious or corrupted frames.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Frame header size: 4 bytes length + 4 bytes checksum
const HEADER_SIZE: usize = 8;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame exceeds `MAX_FRAME_SIZE`
    #[error("frame size {size} exceeds maximum {max}")]
    TooLarge {
        /// Claimed or actual payload size
        size: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Payload does not match its checksum
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum in the header
        expected: u32,
        /// Checksum of the received payload
        actual: u32,
    },

    /// Payload is not the expected JSON
    #[error("invalid frame payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl FrameError {
    /// Whether the stream can continue after this error
    ///
    /// A bad JSON payload is skipped; a bad header or checksum means the
    /// byte stream can no longer be trusted.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Json(_))
    }
}

/// Compute CRC32 checksum for payload
#[inline]
fn compute_checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Encode a message to a length-prefixed frame with CRC32 checksum
///
/// # Errors
///
/// Returns `FrameError::Json` if serialization fails and
/// `FrameError::TooLarge` if the payload exceeds `MAX_FRAME_SIZE`.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_vec(msg)?;

    if json.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: json.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let len = u32::try_from(json.len()).map_err(|_| FrameError::TooLarge {
        size: json.len(),
        max: MAX_FRAME_SIZE,
    })?;
    let checksum = compute_checksum(&json);

    let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of bytes available in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    fn header_u32(&self, offset: usize) -> u32 {
        let start = self.read_pos + offset;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buffer[start..start + 4]);
        u32::from_be_bytes(bytes)
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Ok(Some(msg))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(FrameError::Json)` if the payload was consumed but did not parse
    /// - `Err(...)` if the frame header or checksum is invalid
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        let available = self.available();

        if available < HEADER_SIZE {
            return Ok(None);
        }

        let len = self.header_u32(0) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        if available < HEADER_SIZE + len {
            return Ok(None);
        }

        let expected = self.header_u32(4);
        let payload_start = self.read_pos + HEADER_SIZE;
        let payload_end = payload_start + len;
        let payload = &self.buffer[payload_start..payload_end];

        let actual = compute_checksum(payload);
        if actual != expected {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }

        // Consume the frame even when the JSON is bad so the stream stays aligned
        let parsed = serde_json::from_slice(payload);
        self.read_pos = payload_end;
        Ok(Some(parsed?))
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ClientMessage, Handshake};
    use crate::messages::{MessageId, ServerMessage, SessionId};
    use pretty_assertions::assert_eq;

    fn raw_frame(payload: &[u8], checksum: u32) -> Vec<u8> {
        let mut buf = (payload.len() as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(&checksum.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_server_message_frame() {
        let msg = ServerMessage::TextChunk {
            message_id: MessageId("msg_1".to_string()),
            text: "Hello".to_string(),
        };
        let encoded = encode(&msg).unwrap();
        let payload_len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(payload_len, encoded.len() - HEADER_SIZE);

        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);
        let decoded: ServerMessage = decoder.decode().unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_handshake_then_messages_split_across_reads() {
        let mut bytes = encode(&Handshake::for_session("chat-1")).unwrap();
        bytes.extend(encode(&ClientMessage::Cancel).unwrap());

        let mut decoder = FrameDecoder::new();
        let (first, rest) = bytes.split_at(5);
        decoder.push(first);
        assert!(decoder.decode::<Handshake>().unwrap().is_none());

        decoder.push(rest);
        let handshake: Handshake = decoder.decode().unwrap().unwrap();
        assert_eq!(handshake.session_id, Some(SessionId::new("chat-1")));
        let next: ClientMessage = decoder.decode().unwrap().unwrap();
        assert_eq!(next, ClientMessage::Cancel);
        assert!(decoder.decode::<ClientMessage>().unwrap().is_none());
        assert_eq!(decoder.available(), 0);
    }

    #[test]
    fn test_bad_json_is_skipped() {
        let mut bytes = raw_frame(b"not json", compute_checksum(b"not json"));
        bytes.extend(encode(&ClientMessage::ClearHistory).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let err = decoder.decode::<ClientMessage>().unwrap_err();
        assert!(err.is_recoverable());

        let next: ClientMessage = decoder.decode().unwrap().unwrap();
        assert_eq!(next, ClientMessage::ClearHistory);
    }

    #[test]
    fn test_checksum_mismatch() {
        let payload = br#"{"type":"cancel"}"#;
        let mut decoder = FrameDecoder::new();
        decoder.push(&raw_frame(payload, 0xDEAD_BEEF));

        let err = decoder.decode::<ClientMessage>().unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { expected: 0xDEAD_BEEF, .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_frame_too_large() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes());
        decoder.push(&[0u8; 4]);
        assert!(matches!(
            decoder.decode::<ClientMessage>(),
            Err(FrameError::TooLarge { .. })
        ));

        let huge = ServerMessage::Greeting {
            content: "x".repeat(MAX_FRAME_SIZE + 1),
        };
        assert!(matches!(encode(&huge), Err(FrameError::TooLarge { .. })));
    }
}
