//! `$listening` message builder.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::json;

use crate::error::Result;
use crate::service::{Method, MethodKind, SERVICE_NAME};

/// JSON-RPC method name of the announcement.
pub const LISTENING_METHOD: &str = "$listening";

/// Schema version string.
pub const SCHEMA_VERSION: &str = "1.0";

/// Method entry in the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MethodSchema {
    /// Wire method ID.
    pub id: u16,
    /// Calling convention.
    pub kind: MethodKind,
}

/// Service name plus its methods, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceSchema {
    pub service: String,
    pub methods: BTreeMap<String, MethodSchema>,
}

impl ServiceSchema {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            methods: BTreeMap::new(),
        }
    }

    /// Schema of the greeting service.
    pub fn greet_service() -> Self {
        let mut schema = Self::new(SERVICE_NAME);
        for method in Method::ALL {
            schema.add_method(method.name(), method.id(), method.kind());
        }
        schema
    }

    pub fn add_method(&mut self, name: &str, id: u16, kind: MethodKind) {
        self.methods
            .insert(name.to_string(), MethodSchema { id, kind });
    }

    pub fn get_method(&self, name: &str) -> Option<&MethodSchema> {
        self.methods.get(name)
    }
}

/// Build the `$listening` JSON-RPC line for a server bound to `address`.
pub fn build_listening_message(address: &str, schema: &ServiceSchema) -> Result<String> {
    let msg = json!({
        "jsonrpc": "2.0",
        "method": LISTENING_METHOD,
        "params": {
            "address": address,
            "service": schema.service,
            "version": SCHEMA_VERSION,
            "methods": schema.methods,
        }
    });

    Ok(serde_json::to_string(&msg)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greet_service_schema() {
        let schema = ServiceSchema::greet_service();
        assert_eq!(schema.service, "GreetService");
        assert_eq!(schema.methods.len(), 4);

        let method = schema.get_method("SayHelloClientStreaming").unwrap();
        assert_eq!(method.id, 3);
        assert_eq!(method.kind, MethodKind::ClientStreaming);
    }

    #[test]
    fn test_listening_message_shape() {
        let schema = ServiceSchema::greet_service();
        let line = build_listening_message("127.0.0.1:8080", &schema).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "$listening");
        assert_eq!(value["params"]["address"], "127.0.0.1:8080");
        assert_eq!(value["params"]["service"], "GreetService");
        assert_eq!(value["params"]["version"], "1.0");
        assert_eq!(value["params"]["methods"]["SayHello"]["id"], 1);
        assert_eq!(value["params"]["methods"]["SayHello"]["kind"], "unary");
        assert_eq!(
            value["params"]["methods"]["SayHelloBidirectionalStreaming"]["kind"],
            "bidirectional_streaming"
        );
    }

    #[test]
    fn test_listening_message_is_single_line() {
        let line = build_listening_message("0.0.0.0:8080", &ServiceSchema::greet_service()).unwrap();
        assert!(!line.contains('\n'));
    }
}
