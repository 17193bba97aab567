//! Newline-delimited framing
//!
//! Frames are JSON text terminated by a single `\n` byte. There is no length
//! prefix and no escaping; compact `serde_json` output never contains a raw
//! newline, so encoding is always delimiter-safe.
//!
//! By default the decoder buffers without bound while waiting for a
//! delimiter. A peer that never sends one can grow the buffer until memory
//! runs out; callers that care set a limit with
//! [`FrameDecoder::with_limit`].

use crate::error::{RelayError, Result};
use crate::packet::Packet;

/// Frame delimiter byte
pub const DELIMITER: u8 = b'\n';

/// Accumulates bytes from one connection and splits off complete frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    limit: Option<usize>,
}

impl FrameDecoder {
    /// Unbounded decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that fails once more than `limit` undelimited bytes are buffered
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit: Some(limit),
        }
    }

    /// Append `bytes` and return every complete frame, in order, each
    /// including its trailing delimiter. Trailing bytes after the last
    /// delimiter stay buffered for the next call.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        let scan_from = self.buffer.len();
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut start = 0;
        // Bytes before `scan_from` were already searched on an earlier call
        let mut cursor = scan_from;
        while let Some(offset) = self.buffer[cursor..].iter().position(|&b| b == DELIMITER) {
            let end = cursor + offset + 1;
            frames.push(self.buffer[start..end].to_vec());
            start = end;
            cursor = end;
        }
        if start > 0 {
            self.buffer.drain(..start);
        }

        if let Some(limit) = self.limit {
            if self.buffer.len() > limit {
                return Err(RelayError::BufferLimitExceeded { limit });
            }
        }

        Ok(frames)
    }

    /// Bytes waiting for a delimiter
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Serialize a packet as one wire frame, delimiter included
pub fn encode_frame(packet: &Packet) -> Result<String> {
    let mut line = packet.to_json()?;
    line.push(DELIMITER as char);
    Ok(line)
}
