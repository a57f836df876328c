//! Control line - the `$listening` announcement on stdout.
//!
//! Once the server is bound it prints a single JSON-RPC notification to
//! stdout naming the bound address and the service schema. Logs go to
//! stderr, so a supervising process can read the line without filtering.
//!
//! # Example
//!
//! ```
//! use greetwire::control::{build_listening_message, ServiceSchema};
//!
//! let schema = ServiceSchema::greet_service();
//! let line = build_listening_message("127.0.0.1:8080", &schema).unwrap();
//! assert!(line.contains("$listening"));
//! ```

mod listening;
mod stdio;

pub use listening::{
    build_listening_message, MethodSchema, ServiceSchema, LISTENING_METHOD, SCHEMA_VERSION,
};
pub use stdio::{write_stdout_json, write_stdout_line};
