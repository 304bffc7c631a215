//! fast-LZ compressor, tag 2, threshold 512 bytes (spec.md §4.3). Backed by
//! `snap` (Snappy), the closest real crate to a byte-oriented "fast LZ".

use crate::RpcError;

use super::Compressor;

pub struct FastLzCompressor;

impl Compressor for FastLzCompressor {
    fn tag(&self) -> u8 {
        super::FASTLZ_TAG
    }

    fn name(&self) -> &'static str {
        "fast-lz"
    }

    fn threshold(&self) -> usize {
        512
    }

    fn compress_raw(&self, input: &[u8]) -> crate::Result<Vec<u8>> {
        let mut encoder = snap::raw::Encoder::new();
        encoder
            .compress_vec(input)
            .map_err(|e| RpcError::CompressionError(e.to_string()))
    }

    fn decompress_raw(&self, input: &[u8]) -> crate::Result<Vec<u8>> {
        let mut decoder = snap::raw::Decoder::new();
        decoder
            .decompress_vec(input)
            .map_err(|e| RpcError::DecodeError(format!("fast-lz decompress failed: {e}")))
    }
}
