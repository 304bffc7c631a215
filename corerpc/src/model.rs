//! Core data model: requests, responses, endpoints, and the composite
//! service identity (spec.md §3, §6).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Composite service identity used for registry, dispatch, and consistent
/// hashing: `interface#group#version` (spec.md §3, §6, GLOSSARY).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey(String);

impl ServiceKey {
    pub fn new(interface: &str, group: &str, version: &str) -> Self {
        Self(format!("{interface}#{group}#{version}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request as seen by the client proxy and server dispatcher (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub interface: String,
    pub method: String,
    pub group: String,
    pub version: String,
    pub param_types: Vec<String>,
    pub params: Vec<serde_json::Value>,
    pub auth_token: Option<String>,
    /// Populated by the server on receipt; not meaningful client-side.
    pub client_address: Option<String>,
    pub timestamp_ms: i64,
    /// Interceptor scratch space; never serialized over the wire twice by
    /// the same interceptor, cleared per request.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl RpcRequest {
    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(&self.interface, &self.group, &self.version)
    }

    /// `true` for read-intent method names (spec.md §4.12 role policy).
    pub fn is_read_intent(&self) -> bool {
        const READ_PREFIXES: &[&str] = &["get", "query", "find", "list", "search"];
        READ_PREFIXES
            .iter()
            .any(|p| self.method.starts_with(p))
    }
}

/// Status codes carried in [`RpcResponse::status`] (spec.md §3).
pub mod status {
    pub const OK: u16 = 200;
    pub const UNAUTHENTICATED: u16 = 401;
    pub const RATE_LIMITED: u16 = 429;
    pub const FAILURE: u16 = 500;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub status: u16,
    pub message: String,
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub extensions: HashMap<String, String>,
}

impl RpcResponse {
    pub fn ok(payload: serde_json::Value) -> Self {
        Self {
            status: status::OK,
            message: "ok".to_string(),
            payload: Some(payload),
            extensions: HashMap::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: status::FAILURE,
            message: message.into(),
            payload: None,
            extensions: HashMap::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == status::OK
    }
}

/// A service endpoint. Immutable once constructed (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServiceEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for ServiceEndpoint {
    type Err = crate::RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| crate::RpcError::ProtocolError(format!("invalid endpoint: {s}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| crate::RpcError::ProtocolError(format!("invalid endpoint port: {s}")))?;
        Ok(ServiceEndpoint::new(host, port))
    }
}
