//! # greetwire
//!
//! A greeting RPC service with four calling conventions (unary, server
//! streaming, client streaming, bidirectional streaming) over a small
//! multiplexed binary protocol.
//!
//! ## Architecture
//!
//! - **Wire protocol** ([`protocol`]): 11-byte header plus MessagePack payload
//! - **Sessions** ([`StreamSession`]): one stream per invocation, with
//!   ordered typed send/receive and half-close
//! - **Server** ([`Server`]): dispatches each new stream to a [`GreetService`]
//!   method on its own task
//! - **Client** ([`GreetClient`]): opens a stream per call, many calls per
//!   connection
//!
//! ## Example
//!
//! ```ignore
//! use greetwire::{ClientConfig, GreetClient, Greeter, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::new("127.0.0.1:8080");
//!     let server = Server::new(Greeter::new(config.pacing_interval), config);
//!     let listener = server.bind().await?;
//!     tokio::spawn(async move { server.serve(listener).await });
//!
//!     let client = GreetClient::connect(ClientConfig::default()).await?;
//!     println!("{}", client.say_hello().await?.message);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;

mod backpressure;
mod client;
mod connection;
mod server;
mod session;
mod writer;

pub use client::{ClientStreaming, GreetClient};
pub use config::{ClientConfig, ServerConfig};
pub use error::{GreetError, Result};
pub use server::Server;
pub use service::{
    GreetService, Greeter, HelloRequest, HelloResponse, Method, MethodKind, NameList, NoParam,
};
pub use session::{SessionReceiver, SessionSender, SessionState, StreamSession};
pub use writer::WriterConfig;
