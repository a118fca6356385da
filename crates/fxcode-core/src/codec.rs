//! Length-prefixed CBOR framing for raw (non-WebSocket) sockets.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use crate::error::{FxError, FxResult};
use std::io::Cursor;

/// Largest frame accepted from a peer (16 MiB, enough for a `readFile`).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode a value as a bare CBOR payload (no length prefix).
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> FxResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> FxResult<Vec<u8>> {
    let payload = cbor_encode(value)?;

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> FxResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Streaming frame decoder: accumulates bytes and yields complete payloads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Append raw bytes read from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete raw payload, if one is buffered.
    ///
    /// Fails when the peer announces a frame larger than [`MAX_FRAME_SIZE`].
    pub fn next_frame(&mut self) -> FxResult<Option<Vec<u8>>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let len =
            u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                as usize;
        if len > MAX_FRAME_SIZE {
            return Err(FxError::InvalidMessage(format!(
                "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
            )));
        }
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }

        let payload = self.buffer[4..4 + len].to_vec();
        self.buffer.drain(..4 + len);
        Ok(Some(payload))
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
