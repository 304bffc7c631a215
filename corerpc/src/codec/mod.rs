//! Codec registry: named serializers keyed by a fixed byte tag (spec.md §4.2).
//!
//! Each serializer must be safe for concurrent use and round-trip every
//! representable value. Corrupt bytes raise [`RpcError::SerializationError`].

mod compact;
mod json;
mod portable;

use std::collections::HashMap;

use crate::{RpcError, RpcRequest, RpcResponse};

pub const JSON_TAG: u8 = 1;
pub const PORTABLE_TAG: u8 = 2;
pub const COMPACT_TAG: u8 = 3;

/// A named serializer plus its fixed byte tag (spec.md §4.2).
pub trait Codec: Send + Sync {
    fn tag(&self) -> u8;
    fn name(&self) -> &'static str;

    fn serialize_request(&self, request: &RpcRequest) -> crate::Result<Vec<u8>>;
    fn deserialize_request(&self, bytes: &[u8]) -> crate::Result<RpcRequest>;

    fn serialize_response(&self, response: &RpcResponse) -> crate::Result<Vec<u8>>;
    fn deserialize_response(&self, bytes: &[u8]) -> crate::Result<RpcResponse>;
}

/// Process-wide registry of codecs keyed by byte tag (spec.md §4.2, §9
/// "small enum or fixed array indexed by tag byte").
pub struct CodecRegistry {
    codecs: HashMap<u8, Box<dyn Codec>>,
}

impl CodecRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            codecs: HashMap::new(),
        };
        registry.register(Box::new(json::JsonCodec));
        registry.register(Box::new(portable::PortableCodec));
        registry.register(Box::new(compact::CompactCodec::new()));
        registry
    }

    pub fn register(&mut self, codec: Box<dyn Codec>) {
        self.codecs.insert(codec.tag(), codec);
    }

    pub fn get(&self, tag: u8) -> crate::Result<&dyn Codec> {
        self.codecs
            .get(&tag)
            .map(|c| c.as_ref())
            .ok_or(RpcError::UnknownCodec(tag))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn sample_request() -> RpcRequest {
        RpcRequest {
            interface: "svc.Greeter".into(),
            method: "sayHello".into(),
            group: "default".into(),
            version: "1.0".into(),
            param_types: vec!["string".into()],
            params: vec![serde_json::json!({"name": "world"})],
            auth_token: Some("tok".into()),
            client_address: None,
            timestamp_ms: 123,
            attributes: Map::new(),
        }
    }

    #[test]
    fn every_registered_codec_round_trips_a_request() {
        let registry = CodecRegistry::with_defaults();
        for tag in [JSON_TAG, PORTABLE_TAG, COMPACT_TAG] {
            let codec = registry.get(tag).unwrap();
            let request = sample_request();
            let bytes = codec.serialize_request(&request).unwrap();
            let decoded = codec.deserialize_request(&bytes).unwrap();
            assert_eq!(decoded.interface, request.interface);
            assert_eq!(decoded.params, request.params);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let registry = CodecRegistry::with_defaults();
        assert!(matches!(registry.get(99), Err(RpcError::UnknownCodec(99))));
    }

    #[test]
    fn corrupt_bytes_surface_as_serialization_error() {
        let registry = CodecRegistry::with_defaults();
        let codec = registry.get(COMPACT_TAG).unwrap();
        let err = codec.deserialize_request(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, RpcError::SerializationError(_)));
    }
}
