//! Wire protocol: frame layout, encode/decode (spec.md §3 "Frame", §4.1, §6).
//!
//! Header layout (20 bytes, all multi-byte integers big-endian):
//! `magic(4) | version(1) | total_len(4) | message_type(1) | codec(1) |
//!  compression(1) | request_id(8)`, followed by the payload.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{self, CodecRegistry};
use crate::compression::{self, CompressorRegistry};
use crate::{RpcError, RpcRequest, RpcResponse};

pub const MAGIC: u32 = 0xCAFE_BABE;
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 20;
/// Upper bound on total frame size, rejecting adversarial inputs (spec.md §4.1).
pub const MAX_FRAME_SIZE: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request = 1,
    Response = 2,
}

impl MessageType {
    fn from_u8(b: u8) -> crate::Result<Self> {
        match b {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Response),
            other => Err(RpcError::ProtocolError(format!(
                "unknown message type byte: {other}"
            ))),
        }
    }
}

/// The fixed 20-byte frame header, independent of payload contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub total_len: u32,
    pub message_type: MessageType,
    pub codec_tag: u8,
    pub compression_tag: u8,
    pub request_id: u64,
}

/// A fully decoded frame: header plus raw (already decompressed) payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub codec_tag: u8,
    pub compression_tag: u8,
    pub request_id: u64,
    pub payload: Vec<u8>,
}

/// Encodes a request or response through the chosen codec and compressor,
/// producing a single contiguous frame (spec.md §4.1 "Encode contract").
pub async fn encode_request(
    codecs: &CodecRegistry,
    compressors: &CompressorRegistry,
    codec_tag: u8,
    compression_tag: u8,
    request_id: u64,
    request: &RpcRequest,
) -> crate::Result<Vec<u8>> {
    let codec = codecs.get(codec_tag)?;
    let serialized = codec.serialize_request(request)?;
    encode_frame(
        compressors,
        MessageType::Request,
        codec_tag,
        compression_tag,
        request_id,
        serialized,
    )
}

pub async fn encode_response(
    codecs: &CodecRegistry,
    compressors: &CompressorRegistry,
    codec_tag: u8,
    compression_tag: u8,
    request_id: u64,
    response: &RpcResponse,
) -> crate::Result<Vec<u8>> {
    let codec = codecs.get(codec_tag)?;
    let serialized = codec.serialize_response(response)?;
    encode_frame(
        compressors,
        MessageType::Response,
        codec_tag,
        compression_tag,
        request_id,
        serialized,
    )
}

fn encode_frame(
    compressors: &CompressorRegistry,
    message_type: MessageType,
    codec_tag: u8,
    compression_tag: u8,
    request_id: u64,
    serialized: Vec<u8>,
) -> crate::Result<Vec<u8>> {
    let compressor = compressors.get(compression_tag)?;
    // `compress` may take the pass-through path (below threshold, not
    // smaller, or a failed attempt); the tag it reports back is the one
    // that must be stamped into the header, or decode would hand the raw
    // bytes to the wrong decompressor (spec.md §4.1, §8).
    let (applied_tag, payload) = compressor.compress(&serialized)?;

    let total_len = (HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(total_len as usize);
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.push(VERSION);
    out.extend_from_slice(&total_len.to_be_bytes());
    out.push(message_type as u8);
    out.push(codec_tag);
    out.push(applied_tag);
    out.extend_from_slice(&request_id.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Parses the fixed header out of a 20-byte buffer.
pub fn decode_header(buf: &[u8]) -> crate::Result<FrameHeader> {
    if buf.len() < HEADER_LEN {
        return Err(RpcError::DecodeError("short header".to_string()));
    }
    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(RpcError::ProtocolError(format!(
            "bad magic number: {magic:#010x}"
        )));
    }
    let version = buf[4];
    if version != VERSION {
        return Err(RpcError::UnsupportedVersion(version));
    }
    let total_len = u32::from_be_bytes(buf[5..9].try_into().unwrap());
    if total_len < HEADER_LEN as u32 {
        return Err(RpcError::DecodeError(format!(
            "frame too small: {total_len}"
        )));
    }
    if total_len > MAX_FRAME_SIZE {
        return Err(RpcError::DecodeError(format!(
            "frame too large: {total_len} > {MAX_FRAME_SIZE}"
        )));
    }
    let message_type = MessageType::from_u8(buf[9])?;
    let codec_tag = buf[10];
    let compression_tag = buf[11];
    let request_id = u64::from_be_bytes(buf[12..20].try_into().unwrap());
    Ok(FrameHeader {
        total_len,
        message_type,
        codec_tag,
        compression_tag,
        request_id,
    })
}

/// Reads exactly one frame from an async stream, honoring the length-prefix
/// framing described in spec.md §4.1: incomplete frames remain buffered by
/// the caller simply awaiting more bytes.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    compressors: &CompressorRegistry,
) -> crate::Result<Frame> {
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;
    let header = decode_header(&header_buf)?;

    let body_len = header.total_len as usize - HEADER_LEN;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;

    let compressor = compressors.get(header.compression_tag)?;
    let payload = compressor.decompress(&body)?;

    Ok(Frame {
        message_type: header.message_type,
        codec_tag: header.codec_tag,
        compression_tag: header.compression_tag,
        request_id: header.request_id,
        payload,
    })
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> crate::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

impl Frame {
    pub fn decode_request(&self, codecs: &CodecRegistry) -> crate::Result<RpcRequest> {
        let codec = codecs.get(self.codec_tag)?;
        codec.deserialize_request(&self.payload)
    }

    pub fn decode_response(&self, codecs: &CodecRegistry) -> crate::Result<RpcResponse> {
        let codec = codecs.get(self.codec_tag)?;
        codec.deserialize_response(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::status;
    use std::collections::HashMap;

    fn sample_request() -> RpcRequest {
        RpcRequest {
            interface: "com.example.Greeter".into(),
            method: "sayHello".into(),
            group: "default".into(),
            version: "1.0".into(),
            param_types: vec!["java.lang.String".into()],
            params: vec![serde_json::json!("world")],
            auth_token: None,
            client_address: None,
            timestamp_ms: 1700000000000,
            attributes: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn encode_decode_round_trip_preserves_request() {
        let codecs = CodecRegistry::with_defaults();
        let compressors = CompressorRegistry::with_defaults();
        let request = sample_request();

        let bytes = encode_request(&codecs, &compressors, codec::JSON_TAG, compression::NONE_TAG, 42, &request)
            .await
            .unwrap();

        let total_len = u32::from_be_bytes(bytes[5..9].try_into().unwrap());
        assert_eq!(total_len as usize, bytes.len());

        let mut cursor = std::io::Cursor::new(bytes);
        let frame = read_frame(&mut cursor, &compressors).await.unwrap();
        assert_eq!(frame.request_id, 42);
        let decoded = frame.decode_request(&codecs).unwrap();
        assert_eq!(decoded.interface, request.interface);
        assert_eq!(decoded.method, request.method);
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        let compressors = CompressorRegistry::with_defaults();
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor, &compressors).await.unwrap_err();
        assert!(matches!(err, RpcError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn rejects_undersized_total_length() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4] = VERSION;
        buf[5..9].copy_from_slice(&19u32.to_be_bytes());
        let compressors = CompressorRegistry::with_defaults();
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor, &compressors).await.unwrap_err();
        assert!(matches!(err, RpcError::DecodeError(_)));
    }

    #[tokio::test]
    async fn rejects_unsupported_version() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4] = 9;
        let compressors = CompressorRegistry::with_defaults();
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor, &compressors).await.unwrap_err();
        assert!(matches!(err, RpcError::UnsupportedVersion(9)));
    }

    #[tokio::test]
    async fn compression_round_trip_for_8kib_text_payload() {
        let codecs = CodecRegistry::with_defaults();
        let compressors = CompressorRegistry::with_defaults();
        let mut request = sample_request();
        request.params = vec![serde_json::Value::String("x".repeat(8 * 1024))];

        let bytes = encode_request(
            &codecs,
            &compressors,
            codec::JSON_TAG,
            compression::GZIP_TAG,
            7,
            &request,
        )
        .await
        .unwrap();
        let mut cursor = std::io::Cursor::new(bytes);
        let frame = read_frame(&mut cursor, &compressors).await.unwrap();
        let decoded = frame.decode_request(&codecs).unwrap();
        assert_eq!(decoded.params, request.params);
    }

    #[tokio::test]
    async fn small_payload_round_trips_even_when_a_compressor_is_requested() {
        // Below gzip's threshold: `compress` takes the pass-through path and
        // must stamp NONE_TAG into the header, or decode hands raw bytes to
        // gzip's decoder and fails (spec.md §4.3, §8).
        let codecs = CodecRegistry::with_defaults();
        let compressors = CompressorRegistry::with_defaults();
        let request = sample_request();

        let bytes = encode_request(
            &codecs,
            &compressors,
            codec::JSON_TAG,
            compression::GZIP_TAG,
            11,
            &request,
        )
        .await
        .unwrap();

        let header = decode_header(&bytes[..HEADER_LEN]).unwrap();
        assert_eq!(header.compression_tag, compression::NONE_TAG);

        let mut cursor = std::io::Cursor::new(bytes);
        let frame = read_frame(&mut cursor, &compressors).await.unwrap();
        let decoded = frame.decode_request(&codecs).unwrap();
        assert_eq!(decoded.params, request.params);
    }

    #[test]
    fn response_helpers_set_expected_status() {
        let ok = RpcResponse::ok(serde_json::json!(1));
        assert_eq!(ok.status, status::OK);
        let fail = RpcResponse::failure("boom");
        assert_eq!(fail.status, status::FAILURE);
    }
}
