//! gzip-family compressor, tag 1, threshold 1024 bytes (spec.md §4.3).

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::RpcError;

use super::Compressor;

pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn tag(&self) -> u8 {
        super::GZIP_TAG
    }

    fn name(&self) -> &'static str {
        "gzip"
    }

    fn threshold(&self) -> usize {
        1024
    }

    fn compress_raw(&self, input: &[u8]) -> crate::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(input)
            .map_err(|e| RpcError::CompressionError(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| RpcError::CompressionError(e.to_string()))
    }

    fn decompress_raw(&self, input: &[u8]) -> crate::Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(input);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| RpcError::DecodeError(format!("gzip decompress failed: {e}")))?;
        Ok(out)
    }
}
