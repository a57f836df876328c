//! Server and client configuration.
//!
//! Both configs carry their defaults as named constants, can be adjusted
//! with builder-style setters, and deserialize from JSON with every field
//! optional (durations are given in milliseconds).
//!
//! ```
//! use std::time::Duration;
//! use greetwire::ClientConfig;
//!
//! let config = ClientConfig::from_json(r#"{"addr": "10.0.0.5:9000", "unary_deadline": 250}"#).unwrap();
//! assert_eq!(config.addr, "10.0.0.5:9000");
//! assert_eq!(config.unary_deadline, Some(Duration::from_millis(250)));
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::writer::WriterConfig;

/// Default address the server listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Default address the client dials.
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:8080";

/// Pause between consecutive server-stream responses.
pub const DEFAULT_PACING_INTERVAL: Duration = Duration::from_secs(2);

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for a unary call.
pub const DEFAULT_UNARY_DEADLINE: Duration = Duration::from_secs(1);

/// Deadline covering a whole server-streaming exchange.
pub const DEFAULT_SERVER_STREAMING_DEADLINE: Duration = Duration::from_secs(3);

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind, e.g. `0.0.0.0:8080`.
    pub listen_addr: String,
    /// Delay between server-stream responses.
    #[serde(with = "millis")]
    pub pacing_interval: Duration,
    /// Largest accepted frame payload.
    pub max_payload_size: u32,
    /// Per-connection writer settings.
    pub writer: WriterConfig,
}

impl ServerConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the server unusable.
    pub fn validate(&self) -> Result<()> {
        self.writer.validate()
    }

    pub fn pacing_interval(mut self, interval: Duration) -> Self {
        self.pacing_interval = interval;
        self
    }

    pub fn max_payload_size(mut self, limit: u32) -> Self {
        self.max_payload_size = limit;
        self
    }

    pub fn writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            pacing_interval: DEFAULT_PACING_INTERVAL,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            writer: WriterConfig::default(),
        }
    }
}

/// Client configuration.
///
/// A deadline of `None` means the call may run indefinitely.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address, e.g. `127.0.0.1:8080`.
    pub addr: String,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "opt_millis")]
    pub unary_deadline: Option<Duration>,
    #[serde(with = "opt_millis")]
    pub server_streaming_deadline: Option<Duration>,
    #[serde(with = "opt_millis")]
    pub client_streaming_deadline: Option<Duration>,
    #[serde(with = "opt_millis")]
    pub bidirectional_streaming_deadline: Option<Duration>,
    /// Largest accepted frame payload.
    pub max_payload_size: u32,
    pub writer: WriterConfig,
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.writer.validate()
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn unary_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.unary_deadline = deadline;
        self
    }

    pub fn server_streaming_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.server_streaming_deadline = deadline;
        self
    }

    pub fn client_streaming_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.client_streaming_deadline = deadline;
        self
    }

    pub fn bidirectional_streaming_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.bidirectional_streaming_deadline = deadline;
        self
    }

    pub fn max_payload_size(mut self, limit: u32) -> Self {
        self.max_payload_size = limit;
        self
    }

    pub fn writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_SERVER_ADDR.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            unary_deadline: Some(DEFAULT_UNARY_DEADLINE),
            server_streaming_deadline: Some(DEFAULT_SERVER_STREAMING_DEADLINE),
            client_streaming_deadline: None,
            bidirectional_streaming_deadline: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            writer: WriterConfig::default(),
        }
    }
}

/// `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `Option<Duration>` as integer milliseconds or `null`.
pub(crate) mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
