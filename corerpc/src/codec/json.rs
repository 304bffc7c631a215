//! Text/JSON-like codec, tag 1 (spec.md §4.2). Human-readable, tolerant to
//! unknown fields on input (`serde_json`'s default behavior), omits nulls
//! on output implicitly via `Option<T>` skipping at the field level.

use crate::{RpcError, RpcRequest, RpcResponse};

use super::{Codec, JSON_TAG};

pub struct JsonCodec;

impl Codec for JsonCodec {
    fn tag(&self) -> u8 {
        JSON_TAG
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize_request(&self, request: &RpcRequest) -> crate::Result<Vec<u8>> {
        serde_json::to_vec(request).map_err(|e| RpcError::SerializationError(e.to_string()))
    }

    fn deserialize_request(&self, bytes: &[u8]) -> crate::Result<RpcRequest> {
        serde_json::from_slice(bytes).map_err(|e| RpcError::SerializationError(e.to_string()))
    }

    fn serialize_response(&self, response: &RpcResponse) -> crate::Result<Vec<u8>> {
        serde_json::to_vec(response).map_err(|e| RpcError::SerializationError(e.to_string()))
    }

    fn deserialize_response(&self, bytes: &[u8]) -> crate::Result<RpcResponse> {
        serde_json::from_slice(bytes).map_err(|e| RpcError::SerializationError(e.to_string()))
    }
}
