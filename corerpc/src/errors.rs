//! Error taxonomy for the RPC framework (spec.md §7).

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown codec tag: {0}")]
    UnknownCodec(u8),

    #[error("unknown compressor tag: {0}")]
    UnknownCompressor(u8),

    #[error("frame decode failed: {0}")]
    DecodeError(String),

    #[error("serialization failed: {0}")]
    SerializationError(String),

    #[error("compression failed: {0}")]
    CompressionError(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("request timed out")]
    RequestTimeout,

    #[error("connection pool saturated")]
    PoolSaturated,

    #[error("connection pool closed")]
    PoolClosed,

    #[error("no endpoints available for service {0}")]
    NoEndpoints(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("circuit open for service {0}")]
    CircuitOpen(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("insufficient permissions: {0}")]
    InsufficientPermissions(String),

    #[error("interceptor rejected request: {0}")]
    InterceptorRejected(String),

    #[error("business error: {message}")]
    BusinessError { code: String, message: String },

    #[error("extension not found: {0}")]
    ExtensionNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Retriability classification used by [`crate::retry::RetryPolicy`] (spec.md §4.10).
    pub fn is_well_known_retriable_transport(&self) -> bool {
        const NEEDLES: &[&str] = &[
            "Connection refused",
            "Connection reset",
            "No route to host",
        ];
        match self {
            RpcError::TransportError(msg) => NEEDLES.iter().any(|n| msg.contains(n)),
            RpcError::ConnectTimeout | RpcError::RequestTimeout | RpcError::CircuitOpen(_) => true,
            _ => false,
        }
    }

    /// Maps an error to the response status code it should surface as (spec.md §3, §7).
    pub fn status_code(&self) -> u16 {
        match self {
            RpcError::RateLimited { .. } => 429,
            RpcError::Unauthenticated(_) | RpcError::InsufficientPermissions(_) => 401,
            _ => 500,
        }
    }
}
