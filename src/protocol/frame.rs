//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use greetwire::protocol::{Frame, Header, flags};
//! use bytes::Bytes;
//!
//! let header = Header::new(1, flags::RESPONSE, 42, 5);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.stream_id(), 42);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// A frame whose payload exceeded the receiver's limit and was skipped.
    ///
    /// Only the header survives; the payload is empty.
    pub fn discarded(header: Header) -> Self {
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    /// Check if the payload was skipped for being too large.
    #[inline]
    pub fn is_discarded(&self) -> bool {
        self.payload.len() != self.header.payload_length as usize
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the method ID.
    #[inline]
    pub fn method_id(&self) -> u16 {
        self.header.method_id
    }

    /// Get the stream ID.
    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.header.stream_id
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }

    #[inline]
    pub fn is_end_stream(&self) -> bool {
        self.header.is_end_stream()
    }

    #[inline]
    pub fn is_abort(&self) -> bool {
        self.header.is_abort()
    }
}

/// Build a complete frame as a single byte vector.
///
/// The writer task sends header and payload with vectored writes instead;
/// this is for tests and tools that need contiguous bytes.
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}
