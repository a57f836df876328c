//! Client: connection setup and the four calling conventions.
//!
//! A [`GreetClient`] owns one connection. A background task reads frames
//! and routes them to sessions; every call opens a fresh stream with its
//! own ID, so calls on one client run concurrently without blocking each
//! other.
//!
//! Deadlines come from [`ClientConfig`] and start when the call opens its
//! stream. An elapsed deadline fails the pending operation with
//! [`GreetError::DeadlineExceeded`] and aborts the stream on the server.
//!
//! # Example
//!
//! ```ignore
//! use greetwire::{ClientConfig, GreetClient, NameList};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = GreetClient::connect(ClientConfig::default()).await?;
//!
//!     let response = client.say_hello().await?;
//!     println!("{}", response.message);
//!
//!     let mut responses = client
//!         .say_hello_server_streaming(&NameList::from(vec!["Akyu", "Bkyu"]))
//!         .await?;
//!     while let Some(response) = responses.recv().await? {
//!         println!("{}", response.message);
//!     }
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::connection::{read_frames, Delivery, StreamTable};
use crate::error::{GreetError, Result};
use crate::protocol::{flags, Header, ABORT_METHOD_ID};
use crate::service::{HelloRequest, HelloResponse, Method, NameList, NoParam};
use crate::session::{Role, SessionReceiver, SessionShared, StreamHandle, StreamSession};
use crate::transport;
use crate::writer::{spawn_writer_task, OutboundFrame, WeakWriterHandle, WriterHandle};

/// Greeting client.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct GreetClient {
    config: Arc<ClientConfig>,
    writer: WriterHandle,
    table: Arc<StreamTable>,
    next_stream_id: Arc<AtomicU32>,
}

impl GreetClient {
    /// Dial the configured address.
    ///
    /// Fails with [`GreetError::Connection`] if the server is unreachable
    /// within `connect_timeout`.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let stream = transport::connect(&config.addr, config.connect_timeout).await?;
        tracing::debug!("Connected to {}", config.addr);
        Ok(Self::from_stream(stream, config))
    }

    /// Run the client over an already established byte stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<T>(io: T, config: ClientConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, write_half) = tokio::io::split(io);
        let (writer, _writer_task) = spawn_writer_task(write_half, &config.writer);
        let table = Arc::new(StreamTable::new());

        let read_table = table.clone();
        let abort_writer = writer.downgrade();
        let max_payload_size = config.max_payload_size;
        tokio::spawn(async move {
            let result = read_frames(reader, max_payload_size, |frame| {
                if !frame.is_response() {
                    tracing::warn!(
                        "Dropping request frame for stream {} sent to client",
                        frame.stream_id()
                    );
                    return;
                }
                if frame.is_discarded() {
                    let reason = format!(
                        "response payload size {} exceeds maximum {}",
                        frame.header.payload_length, max_payload_size
                    );
                    if read_table.reset(frame.stream_id(), &reason) {
                        tracing::warn!("Aborting stream {}: {}", frame.stream_id(), reason);
                        send_abort(&abort_writer, frame.stream_id());
                    }
                    return;
                }
                if let Delivery::Unknown(frame) = read_table.deliver(frame) {
                    tracing::debug!("Dropping frame for unknown stream {}", frame.stream_id());
                }
            })
            .await;

            match result {
                Ok(()) => tracing::debug!("Server closed the connection"),
                Err(e) => tracing::warn!("Connection read failed: {}", e),
            }
            read_table.close("connection closed");
        });

        Self {
            config: Arc::new(config),
            writer,
            table,
            next_stream_id: Arc::new(AtomicU32::new(1)),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        !self.table.is_closed()
    }

    pub fn is_backpressure_active(&self) -> bool {
        self.writer.is_backpressure_active()
    }

    /// Frames queued for the socket but not yet written.
    pub fn pending_frames(&self) -> usize {
        self.writer.pending_count()
    }

    /// `SayHello`: one empty request, one response.
    pub async fn say_hello(&self) -> Result<HelloResponse> {
        let mut session =
            self.open::<NoParam, HelloResponse>(Method::SayHello, self.config.unary_deadline)?;
        session.send(&NoParam {}).await?;
        session.close_send().await?;

        let (_sender, mut receiver) = session.split();
        receiver.recv_single().await
    }

    /// `SayHelloServerStreaming`: send the names, then read responses
    /// until `Ok(None)`.
    ///
    /// The server-streaming deadline covers the whole exchange.
    pub async fn say_hello_server_streaming(
        &self,
        request: &NameList,
    ) -> Result<SessionReceiver<HelloResponse>> {
        let session = self.open::<NameList, HelloResponse>(
            Method::SayHelloServerStreaming,
            self.config.server_streaming_deadline,
        )?;
        let (mut sender, receiver) = session.split();
        sender.send(request).await?;
        sender.close_send().await?;
        Ok(receiver)
    }

    /// `SayHelloClientStreaming`: open the request stream.
    pub fn say_hello_client_streaming(&self) -> Result<ClientStreaming> {
        let session = self.open(
            Method::SayHelloClientStreaming,
            self.config.client_streaming_deadline,
        )?;
        Ok(ClientStreaming { session })
    }

    /// Send one request per name and wait for the aggregate response.
    pub async fn say_hello_client_streaming_names(&self, names: &NameList) -> Result<HelloResponse> {
        let mut call = self.say_hello_client_streaming()?;
        for request in names.requests() {
            call.send(&request).await?;
        }
        call.close_and_recv().await
    }

    /// `SayHelloBidirectionalStreaming`: open a session carrying requests
    /// out and responses back. Split it to use both directions from
    /// separate tasks.
    pub fn say_hello_bidirectional_streaming(
        &self,
    ) -> Result<StreamSession<HelloRequest, HelloResponse>> {
        self.open(
            Method::SayHelloBidirectionalStreaming,
            self.config.bidirectional_streaming_deadline,
        )
    }

    /// Register a new stream and wrap it in a caller session.
    fn open<S, R>(&self, method: Method, deadline: Option<Duration>) -> Result<StreamSession<S, R>>
    where
        S: Serialize,
        R: DeserializeOwned,
    {
        if self.table.is_closed() {
            return Err(GreetError::Connection("connection closed".to_string()));
        }

        let stream_id = self.allocate_stream_id()?;
        let shared = Arc::new(SessionShared::default());
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        self.table.register(stream_id, shared.clone(), inbox_tx);

        tracing::debug!("Opening stream {} for {}", stream_id, method.name());

        let handle = StreamHandle::new(method.id(), stream_id, Role::Caller, shared, self.writer.clone())
            .with_max_payload(self.config.max_payload_size);
        let deadline = deadline.map(|timeout| Instant::now() + timeout);
        Ok(StreamSession::new(handle, inbox, self.table.clone(), deadline))
    }

    /// Odd IDs from 1 upward, never reused on this connection.
    fn allocate_stream_id(&self) -> Result<u32> {
        self.next_stream_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(2))
            .map_err(|_| GreetError::Connection("stream IDs exhausted".to_string()))
    }
}

/// Tell the server to stop a stream the read loop gave up on.
fn send_abort(writer: &WeakWriterHandle, stream_id: u32) {
    let Some(writer) = writer.upgrade() else {
        return;
    };
    let header = Header::new(ABORT_METHOD_ID, flags::REQUEST, stream_id, 0);
    if let Err(e) = writer.try_send(OutboundFrame::empty(&header)) {
        tracing::debug!("Could not abort stream {}: {}", stream_id, e);
    }
}

impl std::fmt::Debug for GreetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GreetClient")
            .field("addr", &self.config.addr)
            .field("connected", &self.is_connected())
            .field("open_streams", &self.table.len())
            .finish()
    }
}

/// An in-progress client-streaming call.
#[derive(Debug)]
pub struct ClientStreaming {
    session: StreamSession<HelloRequest, HelloResponse>,
}

impl ClientStreaming {
    pub async fn send(&mut self, request: &HelloRequest) -> Result<()> {
        self.session.send(request).await
    }

    /// Signal that all requests were sent and wait for the response.
    pub async fn close_and_recv(mut self) -> Result<HelloResponse> {
        self.session.close_send().await?;
        let (_sender, mut receiver) = self.session.split();
        receiver.recv_single().await
    }

    pub fn stream_id(&self) -> u32 {
        self.session.stream_id()
    }
}
