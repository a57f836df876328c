//! Wire format encoding and decoding.
//!
//! Every frame starts with an 11-byte header:
//! ```text
//! ┌──────────┬───────┬───────────┬──────────┐
//! │ Method ID│ Flags │ Stream ID │ Length   │
//! │ 2 bytes  │ 1 byte│ 4 bytes   │ 4 bytes  │
//! │ uint16 BE│       │ uint32 BE │ uint32 BE│
//! └──────────┴───────┴───────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use crate::error::{GreetError, Result};

/// Header size in bytes (fixed, exactly 11).
pub const HEADER_SIZE: usize = 11;

/// Default maximum payload size (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Reserved method ID for the ABORT signal (caller cancels a stream).
pub const ABORT_METHOD_ID: u16 = 0xFFFF;

/// Reserved method ID (never use).
pub const RESERVED_METHOD_ID: u16 = 0;

/// Flag constants for the protocol.
pub mod flags {
    /// Direction: server to caller (1) or caller to server (0).
    pub const IS_RESPONSE: u8 = 0b0000_0001;
    /// Error status: the stream failed, payload is the error message.
    pub const IS_ERROR: u8 = 0b0000_0010;
    /// End of stream: the sender has half-closed. Payload is always empty.
    pub const END_STREAM: u8 = 0b0000_0100;

    /// Reserved bits mask (bits 3-7).
    pub const RESERVED_MASK: u8 = 0b1111_1000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }

    // Common flag combinations

    /// Request message: caller to server = 0x00
    pub const REQUEST: u8 = 0;
    /// Caller half-close = 0x04
    pub const REQUEST_END: u8 = END_STREAM;
    /// Response message: server to caller = 0x01
    pub const RESPONSE: u8 = IS_RESPONSE;
    /// Server half-close = 0x05
    pub const RESPONSE_END: u8 = IS_RESPONSE | END_STREAM;
    /// Error status from the server = 0x03
    pub const ERROR_RESPONSE: u8 = IS_RESPONSE | IS_ERROR;
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Method identifier (1-65534, 0 reserved, 0xFFFF = abort).
    pub method_id: u16,
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Stream identifier, one per RPC invocation on a connection.
    pub stream_id: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(method_id: u16, flags: u8, stream_id: u32, payload_length: u32) -> Self {
        Self {
            method_id,
            flags,
            stream_id,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use greetwire::protocol::{Header, flags};
    ///
    /// let header = Header::new(1, flags::RESPONSE, 42, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 11);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.method_id.to_be_bytes());
        buf[2] = self.flags;
        buf[3..7].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[7..11].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    ///
    /// # Example
    ///
    /// ```
    /// use greetwire::protocol::Header;
    ///
    /// let bytes = [0, 2, 0x01, 0, 0, 0, 7, 0, 0, 0, 100];
    /// let header = Header::decode(&bytes).unwrap();
    /// assert_eq!(header.method_id, 2);
    /// assert_eq!(header.stream_id, 7);
    /// assert_eq!(header.payload_length, 100);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            method_id: u16::from_be_bytes([buf[0], buf[1]]),
            flags: buf[2],
            stream_id: u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]),
            payload_length: u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Method ID is not 0 (reserved)
    /// - Payload length doesn't exceed max
    /// - Reserved flag bits are 0
    /// - END_STREAM and ABORT frames carry no payload
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        self.validate_structure()?;

        if self.exceeds(max_payload_size) {
            return Err(GreetError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        Ok(())
    }

    /// Validate everything except the payload size.
    ///
    /// A header failing these checks means the byte stream can no longer be
    /// trusted; an oversized but well-formed frame can still be skipped.
    pub fn validate_structure(&self) -> Result<()> {
        if self.method_id == RESERVED_METHOD_ID {
            return Err(GreetError::Protocol("Method ID 0 is reserved".to_string()));
        }

        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(GreetError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }

        if (self.is_end_stream() || self.is_abort()) && self.payload_length != 0 {
            return Err(GreetError::Protocol(
                "END_STREAM and ABORT frames must have empty payload".to_string(),
            ));
        }

        Ok(())
    }

    /// Check if the payload is larger than `max_payload_size`.
    #[inline]
    pub fn exceeds(&self, max_payload_size: u32) -> bool {
        self.payload_length > max_payload_size
    }

    /// Check if this is an abort signal.
    #[inline]
    pub fn is_abort(&self) -> bool {
        self.method_id == ABORT_METHOD_ID
    }

    /// Check if this frame travels from server to caller.
    #[inline]
    pub fn is_response(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_RESPONSE)
    }

    /// Check if this is an error status.
    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_ERROR)
    }

    /// Check if this is an end-of-stream marker.
    #[inline]
    pub fn is_end_stream(&self) -> bool {
        flags::has_flag(self.flags, flags::END_STREAM)
    }
}
