//! Greeting server.
//!
//! Binds `GREET_ADDR` (default `0.0.0.0:8080`), prints the `$listening`
//! control line on stdout, and serves until Ctrl-C. Logs go to stderr;
//! set `RUST_LOG=debug` for per-stream detail.
//!
//! ```bash
//! cargo run --example server
//! ```

use greetwire::control::{build_listening_message, write_stdout_line, ServiceSchema};
use greetwire::{Greeter, Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("GREET_ADDR") {
        config.listen_addr = addr;
    }

    let server = Server::new(Greeter::new(config.pacing_interval), config);
    let listener = server.bind().await?;

    let address = listener.local_addr()?.to_string();
    write_stdout_line(&build_listening_message(&address, &ServiceSchema::greet_service())?)?;

    server
        .serve_with_shutdown(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
