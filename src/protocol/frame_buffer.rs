//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 11 bytes
//! - `WaitingForPayload`: Header parsed and validated, need N more payload bytes
//! - `Discarding`: Header announced an oversized payload, skipping N more bytes

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

/// Initial read buffer capacity.
const INITIAL_CAPACITY: usize = 8 * 1024;

#[derive(Debug, Clone)]
enum State {
    WaitingForHeader,
    WaitingForPayload { header: Header, remaining: u32 },
    Discarding { remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Every header is validated before its payload is awaited. A malformed
/// header is fatal. An oversized frame is handed out at once as a
/// [`Frame::discarded`] carrying only its header, and its payload is skipped
/// as it arrives without being buffered, so the other streams on the
/// connection keep flowing.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default maximum payload size.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            state: State::WaitingForHeader,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a header fails structural validation. The
    /// connection cannot be resynchronized after that.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                State::WaitingForHeader => {
                    let header = match Header::decode(&self.buffer) {
                        Some(header) => header,
                        None => return Ok(None),
                    };
                    header.validate_structure()?;

                    let _ = self.buffer.split_to(HEADER_SIZE);

                    if header.exceeds(self.max_payload_size) {
                        self.state = State::Discarding {
                            remaining: header.payload_length as usize,
                        };
                        return Ok(Some(Frame::discarded(header)));
                    }

                    if header.payload_length == 0 {
                        return Ok(Some(Frame::new(header, Bytes::new())));
                    }

                    self.state = State::WaitingForPayload {
                        header,
                        remaining: header.payload_length,
                    };
                }

                State::WaitingForPayload { header, remaining } => {
                    let remaining = remaining as usize;
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    // Zero-copy freeze
                    let payload = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForHeader;

                    return Ok(Some(Frame::new(header, payload)));
                }

                State::Discarding { remaining } => {
                    let skip = remaining.min(self.buffer.len());
                    let _ = self.buffer.split_to(skip);

                    if skip < remaining {
                        self.state = State::Discarding {
                            remaining: remaining - skip,
                        };
                        return Ok(None);
                    }
                    self.state = State::WaitingForHeader;
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Check if a frame has started but not finished arriving.
    pub fn is_mid_frame(&self) -> bool {
        !self.buffer.is_empty() || !matches!(self.state, State::WaitingForHeader)
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
            State::Discarding { .. } => "Discarding",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
