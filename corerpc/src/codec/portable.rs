//! Portable binary codec, tag 2 (spec.md §4.2): self-describing binary with
//! type information carried alongside the data, the closest real-crate
//! match for the distillation's "Hessian-equivalent" description.

use crate::{RpcError, RpcRequest, RpcResponse};

use super::{Codec, PORTABLE_TAG};

pub struct PortableCodec;

impl Codec for PortableCodec {
    fn tag(&self) -> u8 {
        PORTABLE_TAG
    }

    fn name(&self) -> &'static str {
        "portable-binary"
    }

    fn serialize_request(&self, request: &RpcRequest) -> crate::Result<Vec<u8>> {
        rmp_serde::to_vec_named(request).map_err(|e| RpcError::SerializationError(e.to_string()))
    }

    fn deserialize_request(&self, bytes: &[u8]) -> crate::Result<RpcRequest> {
        rmp_serde::from_slice(bytes).map_err(|e| RpcError::SerializationError(e.to_string()))
    }

    fn serialize_response(&self, response: &RpcResponse) -> crate::Result<Vec<u8>> {
        rmp_serde::to_vec_named(response).map_err(|e| RpcError::SerializationError(e.to_string()))
    }

    fn deserialize_response(&self, bytes: &[u8]) -> crate::Result<RpcResponse> {
        rmp_serde::from_slice(bytes).map_err(|e| RpcError::SerializationError(e.to_string()))
    }
}
