//! Message types exchanged by the greeting service.

use serde::{Deserialize, Serialize};

/// Parameterless request marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoParam {}

/// Ordered list of names; responses follow this order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameList {
    pub names: Vec<String>,
}

impl NameList {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// One [`HelloRequest`] per name, in order.
    pub fn requests(&self) -> impl Iterator<Item = HelloRequest> + '_ {
        self.names.iter().map(|name| HelloRequest::new(name.clone()))
    }
}

impl<S: Into<String>> From<Vec<S>> for NameList {
    fn from(names: Vec<S>) -> Self {
        Self::new(names.into_iter().map(Into::into).collect())
    }
}

/// Per-name request used by client and bidirectional streaming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub name: String,
}

impl HelloRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// The greeting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloResponse {
    pub message: String,
}

impl HelloResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
