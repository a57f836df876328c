//! The greeting service: messages, the handler trait, and its method table.
//!
//! [`GreetService`] has one method per RPC and no default bodies; an
//! implementation must provide all four calling conventions.
//!
//! | method                           | id | kind                    |
//! |----------------------------------|----|-------------------------|
//! | `SayHello`                       | 1  | unary                   |
//! | `SayHelloServerStreaming`        | 2  | server streaming        |
//! | `SayHelloClientStreaming`        | 3  | client streaming        |
//! | `SayHelloBidirectionalStreaming` | 4  | bidirectional streaming |

mod greeter;
mod messages;

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;

pub use greeter::Greeter;
pub use messages::{HelloRequest, HelloResponse, NameList, NoParam};

use crate::error::Result;
use crate::session::{SessionReceiver, SessionSender, StreamSession};

/// Boxed future returned by service handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Service name announced on the control line.
pub const SERVICE_NAME: &str = "GreetService";

/// Calling convention of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// One request, one response.
    Unary,
    /// One request, a stream of responses.
    ServerStreaming,
    /// A stream of requests, one response.
    ClientStreaming,
    /// Independent request and response streams.
    BidirectionalStreaming,
}

/// The four greeting RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    SayHello,
    SayHelloServerStreaming,
    SayHelloClientStreaming,
    SayHelloBidirectionalStreaming,
}

impl Method {
    /// All methods in ID order.
    pub const ALL: [Method; 4] = [
        Method::SayHello,
        Method::SayHelloServerStreaming,
        Method::SayHelloClientStreaming,
        Method::SayHelloBidirectionalStreaming,
    ];

    /// Wire ID (0 and 0xFFFF are reserved by the protocol).
    pub fn id(self) -> u16 {
        match self {
            Method::SayHello => 1,
            Method::SayHelloServerStreaming => 2,
            Method::SayHelloClientStreaming => 3,
            Method::SayHelloBidirectionalStreaming => 4,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|method| method.id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            Method::SayHello => "SayHello",
            Method::SayHelloServerStreaming => "SayHelloServerStreaming",
            Method::SayHelloClientStreaming => "SayHelloClientStreaming",
            Method::SayHelloBidirectionalStreaming => "SayHelloBidirectionalStreaming",
        }
    }

    pub fn kind(self) -> MethodKind {
        match self {
            Method::SayHello => MethodKind::Unary,
            Method::SayHelloServerStreaming => MethodKind::ServerStreaming,
            Method::SayHelloClientStreaming => MethodKind::ClientStreaming,
            Method::SayHelloBidirectionalStreaming => MethodKind::BidirectionalStreaming,
        }
    }
}

/// Server-side implementation of the greeting RPCs.
///
/// Each invocation runs on its own task. Returning `Err` terminates the
/// stream with an error status, unless the stream is already unwritable
/// (e.g. the caller went away), in which case the error is only logged.
pub trait GreetService: Send + Sync + 'static {
    /// `SayHello(NoParam) -> HelloResponse`
    fn say_hello(&self, request: NoParam) -> BoxFuture<'_, Result<HelloResponse>>;

    /// `SayHelloServerStreaming(NameList) -> stream HelloResponse`
    ///
    /// The stream is completed after the handler returns `Ok` unless it
    /// already called `close_send`.
    fn say_hello_server_streaming(
        &self,
        request: NameList,
        responses: SessionSender<HelloResponse>,
    ) -> BoxFuture<'_, Result<()>>;

    /// `SayHelloClientStreaming(stream HelloRequest) -> HelloResponse`
    fn say_hello_client_streaming(
        &self,
        requests: SessionReceiver<HelloRequest>,
    ) -> BoxFuture<'_, Result<HelloResponse>>;

    /// `SayHelloBidirectionalStreaming(stream HelloRequest) <-> stream HelloResponse`
    fn say_hello_bidirectional_streaming(
        &self,
        stream: StreamSession<HelloResponse, HelloRequest>,
    ) -> BoxFuture<'_, Result<()>>;
}
