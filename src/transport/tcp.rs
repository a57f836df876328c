//! TCP implementation.
//!
//! # Example
//!
//! ```ignore
//! use greetwire::transport::{connect, Listener};
//!
//! let listener = Listener::bind("127.0.0.1:0").await?;
//! let stream = connect(&listener.local_addr()?.to_string(), Duration::from_secs(5)).await?;
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::error::{GreetError, Result};

/// Listening TCP socket.
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    /// Bind to `addr` (e.g. `0.0.0.0:8080`, or port 0 for an ephemeral port).
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GreetError::Connection(format!("failed to listen on {}: {}", addr, e)))?;
        Ok(Self { listener })
    }

    /// Accept a single connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer))
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}

/// Dial `addr`, giving up after `timeout`.
///
/// Both a refused connection and an elapsed timeout are reported as
/// [`GreetError::Connection`].
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(GreetError::Connection(format!(
                "failed to connect to {}: {}",
                addr, e
            )))
        }
        Err(_) => {
            return Err(GreetError::Connection(format!(
                "timed out connecting to {} after {:?}",
                addr, timeout
            )))
        }
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}
