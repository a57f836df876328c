//! Codec module - serialization of message payloads.
//!
//! Codecs are marker structs with static methods rather than trait objects,
//! so the codec is chosen at compile time.
//!
//! # Example
//!
//! ```
//! use greetwire::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
