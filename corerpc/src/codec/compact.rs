//! Compact binary codec, tag 3 (spec.md §4.2): schema is derived from the
//! `Serialize`/`Deserialize` impl at compile time rather than a predeclared
//! IDL — the Rust-trait equivalent of "reflection-derived schema, no
//! predeclared `.proto`". Reuses a small pool of scratch buffers instead of
//! the source's thread-local buffer (spec.md §9 Design Note, SPEC_FULL §4.2).
//!
//! `bincode` is not self-describing: it cannot drive `serde_json::Value`'s
//! `Deserialize` impl, which requires `deserialize_any`. `RpcRequest.params`
//! and `RpcResponse.payload` are `serde_json::Value`, so this codec carries
//! them as pre-rendered JSON text in a concrete-field wire struct — bincode
//! only ever sees plain `String`/`Option<String>` fields — and re-parses
//! that text back into `Value` on the way out.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::{RpcError, RpcRequest, RpcResponse};

use super::{Codec, COMPACT_TAG};

const POOLED_BUFFER_CAPACITY: usize = 4096;
const MAX_POOLED_BUFFERS: usize = 32;

/// A pool of reusable scratch buffers. `acquire` hands out a cleared buffer;
/// `release` returns it for reuse (or drops it once the pool is full).
struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
        }
    }

    fn acquire(&self) -> Vec<u8> {
        let mut guard = self.buffers.lock().unwrap();
        guard
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(POOLED_BUFFER_CAPACITY))
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut guard = self.buffers.lock().unwrap();
        if guard.len() < MAX_POOLED_BUFFERS {
            guard.push(buf);
        }
    }
}

/// `RpcRequest`, with `params` rendered to a JSON string so every field is a
/// concrete, non-self-describing-only type bincode can deserialize directly.
#[derive(Serialize, Deserialize)]
struct WireRequest {
    interface: String,
    method: String,
    group: String,
    version: String,
    param_types: Vec<String>,
    params_json: String,
    auth_token: Option<String>,
    client_address: Option<String>,
    timestamp_ms: i64,
    attributes: HashMap<String, String>,
}

impl WireRequest {
    fn from_request(request: &RpcRequest) -> crate::Result<Self> {
        Ok(Self {
            interface: request.interface.clone(),
            method: request.method.clone(),
            group: request.group.clone(),
            version: request.version.clone(),
            param_types: request.param_types.clone(),
            params_json: serde_json::to_string(&request.params)
                .map_err(|e| RpcError::SerializationError(e.to_string()))?,
            auth_token: request.auth_token.clone(),
            client_address: request.client_address.clone(),
            timestamp_ms: request.timestamp_ms,
            attributes: request.attributes.clone(),
        })
    }

    fn into_request(self) -> crate::Result<RpcRequest> {
        let params = serde_json::from_str(&self.params_json)
            .map_err(|e| RpcError::SerializationError(e.to_string()))?;
        Ok(RpcRequest {
            interface: self.interface,
            method: self.method,
            group: self.group,
            version: self.version,
            param_types: self.param_types,
            params,
            auth_token: self.auth_token,
            client_address: self.client_address,
            timestamp_ms: self.timestamp_ms,
            attributes: self.attributes,
        })
    }
}

/// `RpcResponse`, with `payload` rendered to an optional JSON string for the
/// same reason as [`WireRequest::params_json`].
#[derive(Serialize, Deserialize)]
struct WireResponse {
    status: u16,
    message: String,
    payload_json: Option<String>,
    extensions: HashMap<String, String>,
}

impl WireResponse {
    fn from_response(response: &RpcResponse) -> crate::Result<Self> {
        let payload_json = response
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RpcError::SerializationError(e.to_string()))?;
        Ok(Self {
            status: response.status,
            message: response.message.clone(),
            payload_json,
            extensions: response.extensions.clone(),
        })
    }

    fn into_response(self) -> crate::Result<RpcResponse> {
        let payload = self
            .payload_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| RpcError::SerializationError(e.to_string()))?;
        Ok(RpcResponse {
            status: self.status,
            message: self.message,
            payload,
            extensions: self.extensions,
        })
    }
}

pub struct CompactCodec {
    pool: BufferPool,
}

impl CompactCodec {
    pub fn new() -> Self {
        Self {
            pool: BufferPool::new(),
        }
    }

    fn encode<T: serde::Serialize>(&self, value: &T) -> crate::Result<Vec<u8>> {
        let mut buf = self.pool.acquire();
        let encoded =
            bincode::serialize(value).map_err(|e| RpcError::SerializationError(e.to_string()))?;
        buf.extend_from_slice(&encoded);
        let out = buf.clone();
        self.pool.release(buf);
        Ok(out)
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, bytes: &[u8]) -> crate::Result<T> {
        bincode::deserialize(bytes).map_err(|e| RpcError::SerializationError(e.to_string()))
    }
}

impl Default for CompactCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for CompactCodec {
    fn tag(&self) -> u8 {
        COMPACT_TAG
    }

    fn name(&self) -> &'static str {
        "compact-binary"
    }

    fn serialize_request(&self, request: &RpcRequest) -> crate::Result<Vec<u8>> {
        self.encode(&WireRequest::from_request(request)?)
    }

    fn deserialize_request(&self, bytes: &[u8]) -> crate::Result<RpcRequest> {
        self.decode::<WireRequest>(bytes)?.into_request()
    }

    fn serialize_response(&self, response: &RpcResponse) -> crate::Result<Vec<u8>> {
        self.encode(&WireResponse::from_response(response)?)
    }

    fn deserialize_response(&self, bytes: &[u8]) -> crate::Result<RpcResponse> {
        self.decode::<WireResponse>(bytes)?.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_pool_reuses_released_buffers() {
        let pool = BufferPool::new();
        let buf = pool.acquire();
        let ptr = buf.as_ptr();
        pool.release(buf);
        let reused = pool.acquire();
        assert_eq!(reused.as_ptr(), ptr);
    }

    fn sample_request() -> RpcRequest {
        RpcRequest {
            interface: "svc.Greeter".into(),
            method: "sayHello".into(),
            group: "default".into(),
            version: "1.0".into(),
            param_types: vec!["string".into()],
            params: vec![serde_json::json!({"name": "world"}), serde_json::json!([1, 2, 3])],
            auth_token: Some("tok".into()),
            client_address: None,
            timestamp_ms: 123,
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn round_trips_a_request_with_non_empty_object_and_array_params() {
        let codec = CompactCodec::new();
        let request = sample_request();
        let bytes = codec.serialize_request(&request).unwrap();
        let decoded = codec.deserialize_request(&bytes).unwrap();
        assert_eq!(decoded.params, request.params);
        assert_eq!(decoded.interface, request.interface);
    }

    #[test]
    fn round_trips_a_response_with_a_non_empty_payload() {
        let codec = CompactCodec::new();
        let response = RpcResponse::ok(serde_json::json!({"greeting": "hello, world"}));
        let bytes = codec.serialize_response(&response).unwrap();
        let decoded = codec.deserialize_response(&bytes).unwrap();
        assert_eq!(decoded.payload, response.payload);
    }

    #[test]
    fn round_trips_a_response_with_no_payload() {
        let codec = CompactCodec::new();
        let response = RpcResponse::failure("boom");
        let bytes = codec.serialize_response(&response).unwrap();
        let decoded = codec.deserialize_response(&bytes).unwrap();
        assert_eq!(decoded.payload, None);
        assert_eq!(decoded.message, "boom");
    }
}
