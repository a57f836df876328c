//! Server: accept loop, per-connection read loop, per-invocation tasks.
//!
//! Every accepted connection gets its own writer task and stream table. The
//! first frame carrying a new stream ID opens a session and spawns a task
//! that runs the matching [`GreetService`] method; when the method returns
//! the task finishes the stream (END on success, an error status on
//! failure).
//!
//! # Example
//!
//! ```ignore
//! use greetwire::{Greeter, Server, ServerConfig};
//!
//! let config = ServerConfig::default();
//! let server = Server::new(Greeter::new(config.pacing_interval), config);
//! let listener = server.bind().await?;
//! server.serve(listener).await?;
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::codec::MsgPackCodec;
use crate::config::ServerConfig;
use crate::connection::{read_frames, Delivery, Inbound, StreamTable};
use crate::error::{GreetError, Result};
use crate::protocol::{flags, Frame, Header};
use crate::service::{GreetService, HelloRequest, HelloResponse, Method, NameList, NoParam};
use crate::session::{Role, SessionShared, StreamHandle, StreamSession};
use crate::transport::Listener;
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Pause after a failed accept, so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Greeting server.
///
/// Cheap to clone; clones share the service and configuration.
pub struct Server<S> {
    service: Arc<S>,
    config: Arc<ServerConfig>,
}

impl<S> Clone for Server<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: GreetService> Server<S> {
    pub fn new(service: S, config: ServerConfig) -> Self {
        Self {
            service: Arc::new(service),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<Listener> {
        self.config.validate()?;
        let listener = Listener::bind(&self.config.listen_addr).await?;
        tracing::info!("Server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections forever, one task per connection.
    pub async fn serve(&self, listener: Listener) -> Result<()> {
        let listener = &listener;
        self.accept_loop(move || listener.accept()).await
    }

    async fn accept_loop<T, F, Fut>(&self, mut accept: F) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(T, SocketAddr)>>,
    {
        loop {
            match accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!("Accepted connection from {}", peer);
                    let server = self.clone();
                    tokio::spawn(async move {
                        match server.serve_connection(stream).await {
                            Ok(()) => tracing::debug!("Connection from {} closed", peer),
                            Err(e) => tracing::warn!("Connection from {} failed: {}", peer, e),
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn serve_with_shutdown<F>(&self, listener: Listener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.serve(listener) => result,
            _ = shutdown => {
                tracing::info!("Server shutting down");
                Ok(())
            }
        }
    }

    /// Serve one connection until the peer closes it.
    ///
    /// Every session still live on the connection fails with a transport
    /// error once it ends.
    pub async fn serve_connection<T>(&self, io: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, write_half) = tokio::io::split(io);
        let (writer, _writer_task) = spawn_writer_task(write_half, &self.config.writer);
        let table = Arc::new(StreamTable::new());
        let mut highest_stream_id = 0u32;

        let result = read_frames(reader, self.config.max_payload_size, |frame| {
            if frame.is_response() {
                tracing::warn!(
                    "Dropping response frame for stream {} sent to server",
                    frame.stream_id()
                );
                return;
            }

            if frame.is_discarded() {
                let stream_id = frame.stream_id();
                let error = GreetError::Protocol(format!(
                    "Payload size {} exceeds maximum {}",
                    frame.header.payload_length, self.config.max_payload_size
                ));
                if !table.reset(stream_id, &error.to_string()) {
                    if stream_id <= highest_stream_id {
                        tracing::debug!("Dropping oversized frame for finished stream {}", stream_id);
                        return;
                    }
                    highest_stream_id = stream_id;
                }
                tracing::warn!("Failing stream {}: {}", stream_id, error);
                reject(&writer, frame.method_id(), stream_id, &error.to_string());
                return;
            }

            let frame = match table.deliver(frame) {
                Delivery::Unknown(frame) => frame,
                Delivery::Delivered | Delivery::Dropped => return,
            };

            // Stream IDs only grow; anything lower belongs to a finished stream
            if frame.stream_id() <= highest_stream_id {
                tracing::debug!("Dropping frame for finished stream {}", frame.stream_id());
                return;
            }
            highest_stream_id = frame.stream_id();

            self.open_stream(frame, &table, &writer);
        })
        .await;

        table.close("connection closed");
        result
    }

    fn open_stream(&self, frame: Frame, table: &Arc<StreamTable>, writer: &WriterHandle) {
        let stream_id = frame.stream_id();

        if frame.is_error() {
            tracing::warn!("Dropping error frame opening stream {}", stream_id);
            return;
        }

        let method = match Method::from_id(frame.method_id()) {
            Some(method) => method,
            None => {
                let error = GreetError::UnknownMethod(frame.method_id());
                tracing::warn!("Rejecting stream {}: {}", stream_id, error);
                reject(writer, frame.method_id(), stream_id, &error.to_string());
                return;
            }
        };

        let shared = Arc::new(SessionShared::default());
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        table.register(stream_id, shared.clone(), inbox_tx);
        table.deliver(frame);

        let invocation = Invocation {
            handle: StreamHandle::new(method.id(), stream_id, Role::Handler, shared, writer.clone())
                .with_max_payload(self.config.max_payload_size),
            inbox,
            table: table.clone(),
        };

        tokio::spawn(run_invocation(self.service.clone(), method, invocation));
    }
}

/// Terminate a stream that never got a session.
fn reject(writer: &WriterHandle, method_id: u16, stream_id: u32, message: &str) {
    let payload = match MsgPackCodec::encode_bytes(&message) {
        Ok(payload) => payload,
        Err(_) => return,
    };
    let header = Header::new(method_id, flags::ERROR_RESPONSE, stream_id, payload.len() as u32);
    if let Err(e) = writer.try_send(OutboundFrame::new(&header, payload)) {
        tracing::debug!("Could not reject stream {}: {}", stream_id, e);
    }
}

/// A registered stream waiting for its handler.
struct Invocation {
    handle: StreamHandle,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    table: Arc<StreamTable>,
}

impl Invocation {
    fn session<R: DeserializeOwned>(self) -> StreamSession<HelloResponse, R> {
        StreamSession::new(self.handle, self.inbox, self.table, None)
    }
}

async fn run_invocation<S: GreetService>(service: Arc<S>, method: Method, invocation: Invocation) {
    let handle = invocation.handle.clone();
    let stream_id = handle.stream_id();
    tracing::debug!("Stream {} opened for {}", stream_id, method.name());

    match dispatch(service.as_ref(), method, invocation).await {
        Ok(()) => {
            if handle.is_writable() {
                if let Err(e) = handle.close_send(None).await {
                    tracing::debug!("Could not complete stream {}: {}", stream_id, e);
                }
            }
        }
        Err(e) if handle.is_writable() => {
            tracing::error!("Handler error for {} on stream {}: {}", method.name(), stream_id, e);
            if let Err(send_err) = handle.send_error(&e.to_string()).await {
                tracing::debug!("Could not report error on stream {}: {}", stream_id, send_err);
            }
        }
        Err(e) => {
            tracing::warn!("{} on stream {} stopped: {}", method.name(), stream_id, e);
        }
    }
}

async fn dispatch<S: GreetService>(service: &S, method: Method, invocation: Invocation) -> Result<()> {
    match method {
        Method::SayHello => {
            let (mut responses, mut requests) = invocation.session::<NoParam>().split();
            let request = requests.recv_single().await?;
            let response = service.say_hello(request).await?;
            responses.send(&response).await
        }
        Method::SayHelloServerStreaming => {
            let (responses, mut requests) = invocation.session::<NameList>().split();
            let request = requests.recv_single().await?;
            service.say_hello_server_streaming(request, responses).await
        }
        Method::SayHelloClientStreaming => {
            let (mut responses, requests) = invocation.session::<HelloRequest>().split();
            let response = service.say_hello_client_streaming(requests).await?;
            responses.send(&response).await
        }
        Method::SayHelloBidirectionalStreaming => {
            service
                .say_hello_bidirectional_streaming(invocation.session())
                .await
        }
    }
}
