//! The greeting handlers.

use std::time::Duration;

use super::{BoxFuture, GreetService, HelloRequest, HelloResponse, NameList, NoParam};
use crate::config::DEFAULT_PACING_INTERVAL;
use crate::error::Result;
use crate::session::{SessionReceiver, SessionSender, StreamSession};

/// [`GreetService`] implementation.
///
/// Server streaming pauses `pacing` between consecutive responses. The
/// pause runs on the invocation's own task.
#[derive(Debug, Clone)]
pub struct Greeter {
    pacing: Duration,
}

impl Greeter {
    pub fn new(pacing: Duration) -> Self {
        Self { pacing }
    }

    pub fn pacing(&self) -> Duration {
        self.pacing
    }

    /// Unary response.
    pub fn hello() -> HelloResponse {
        HelloResponse::new("Hello from gRPC Server!")
    }

    /// Server-stream response for one name.
    pub fn hello_server_stream(name: &str) -> HelloResponse {
        HelloResponse::new(format!("Hello {} from gRPC Server Stream!", name))
    }

    /// Aggregate client-stream response.
    pub fn hello_client_stream(names: &[String]) -> HelloResponse {
        if names.is_empty() {
            return HelloResponse::new("Hello from gRPC Client Stream!");
        }
        HelloResponse::new(format!(
            "Hello {} from gRPC Client Stream!",
            names.join(", ")
        ))
    }

    /// Bidirectional-stream response for one name.
    pub fn hello_bidirectional_stream(name: &str) -> HelloResponse {
        HelloResponse::new(format!("Hello {} from gRPC Bidirectional Stream!", name))
    }
}

impl Default for Greeter {
    fn default() -> Self {
        Self::new(DEFAULT_PACING_INTERVAL)
    }
}

impl GreetService for Greeter {
    fn say_hello(&self, _request: NoParam) -> BoxFuture<'_, Result<HelloResponse>> {
        Box::pin(async { Ok(Self::hello()) })
    }

    fn say_hello_server_streaming(
        &self,
        request: NameList,
        mut responses: SessionSender<HelloResponse>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tracing::info!("Received request for server streaming: {:?}", request.names);

            for (i, name) in request.names.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(self.pacing).await;
                }
                responses.send(&Self::hello_server_stream(name)).await?;
            }

            responses.close_send().await
        })
    }

    fn say_hello_client_streaming(
        &self,
        mut requests: SessionReceiver<HelloRequest>,
    ) -> BoxFuture<'_, Result<HelloResponse>> {
        Box::pin(async move {
            let mut names = Vec::new();
            while let Some(request) = requests.recv().await? {
                tracing::info!("Got request with name: {}", request.name);
                names.push(request.name);
            }

            Ok(Self::hello_client_stream(&names))
        })
    }

    fn say_hello_bidirectional_streaming(
        &self,
        mut stream: StreamSession<HelloResponse, HelloRequest>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            while let Some(request) = stream.recv().await? {
                tracing::info!("Got request with name: {}", request.name);
                stream
                    .send(&Self::hello_bidirectional_stream(&request.name))
                    .await?;
            }

            stream.close_send().await
        })
    }
}
