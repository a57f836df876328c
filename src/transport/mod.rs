//! Transport module - TCP listener and dialer.
//!
//! The protocol runs over any `AsyncRead + AsyncWrite` byte stream; this
//! module provides the TCP plumbing used by the server and client.

mod tcp;

pub use tcp::{connect, Listener};
