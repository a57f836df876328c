//! Greeting client.
//!
//! Runs one calling convention against `GREET_ADDR` (default
//! `127.0.0.1:8080`), chosen by the first argument:
//!
//! ```bash
//! cargo run --example client -- unary
//! cargo run --example client -- server-stream
//! cargo run --example client -- client-stream
//! cargo run --example client -- bidi
//! ```

use std::time::Duration;

use greetwire::{ClientConfig, GreetClient, HelloRequest, NameList};
use tracing::info;

/// Pause between requests in the client-driven modes.
const SEND_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "unary".to_string());

    let mut config = ClientConfig::default();
    if let Ok(addr) = std::env::var("GREET_ADDR") {
        config.addr = addr;
    }

    let client = GreetClient::connect(config).await?;
    let names = NameList::from(vec!["Akyu", "Bkyu", "Ckyu"]);

    match mode.as_str() {
        "unary" => call_say_hello(&client).await?,
        "server-stream" => call_server_streaming(&client, &names).await?,
        "client-stream" => call_client_streaming(&client, &names).await?,
        "bidi" => call_bidirectional_streaming(&client, &names).await?,
        other => {
            return Err(format!(
                "unknown mode {:?}, expected unary | server-stream | client-stream | bidi",
                other
            )
            .into())
        }
    }

    Ok(())
}

async fn call_say_hello(client: &GreetClient) -> greetwire::Result<()> {
    let response = client.say_hello().await?;
    info!("Response from SayHello: {}", response.message);
    Ok(())
}

async fn call_server_streaming(client: &GreetClient, names: &NameList) -> greetwire::Result<()> {
    info!("Streaming started");
    let mut responses = client.say_hello_server_streaming(names).await?;
    while let Some(response) = responses.recv().await? {
        info!("Received response from SayHelloServerStreaming: {}", response.message);
    }
    info!("Streaming finished");
    Ok(())
}

async fn call_client_streaming(client: &GreetClient, names: &NameList) -> greetwire::Result<()> {
    info!("Client streaming started");
    let mut call = client.say_hello_client_streaming()?;
    for request in names.requests() {
        call.send(&request).await?;
        info!("Sent request with name: {}", request.name);
        tokio::time::sleep(SEND_INTERVAL).await;
    }

    let response = call.close_and_recv().await?;
    info!("Client streaming finished: {}", response.message);
    Ok(())
}

async fn call_bidirectional_streaming(
    client: &GreetClient,
    names: &NameList,
) -> greetwire::Result<()> {
    info!("Bidirectional streaming started");
    let (mut requests, mut responses) = client.say_hello_bidirectional_streaming()?.split();

    let reader = tokio::spawn(async move {
        while let Some(response) = responses.recv().await? {
            info!("Received: {}", response.message);
        }
        Ok::<_, greetwire::GreetError>(())
    });

    for name in &names.names {
        requests.send(&HelloRequest::new(name.as_str())).await?;
        tokio::time::sleep(SEND_INTERVAL).await;
    }
    requests.close_send().await?;

    match reader.await {
        Ok(result) => result?,
        Err(e) => tracing::error!("Response reader panicked: {}", e),
    }
    info!("Bidirectional streaming finished");
    Ok(())
}
