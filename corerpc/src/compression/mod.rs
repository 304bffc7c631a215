//! Compressor registry: named compressors keyed by a fixed byte tag
//! (spec.md §4.3).
//!
//! Policy: if compressed output is not strictly smaller than the input,
//! return the original buffer unchanged; if compression fails, return the
//! original buffer and log a warning rather than corrupt the stream.
//! Decompression is strict — failures are fatal to the frame.

mod fastlz;
mod gzip;
mod lz4compat;
mod none;

use std::collections::HashMap;

use log::warn;

use crate::RpcError;

pub const NONE_TAG: u8 = 0;
pub const GZIP_TAG: u8 = 1;
pub const FASTLZ_TAG: u8 = 2;
pub const LZ4_TAG: u8 = 3;

/// Per-algorithm "don't bother unless it's worth it" threshold (spec.md §4.3).
pub trait Compressor: Send + Sync {
    fn tag(&self) -> u8;
    fn name(&self) -> &'static str;
    fn threshold(&self) -> usize;

    /// Raw, possibly-smaller compression with no policy applied.
    fn compress_raw(&self, input: &[u8]) -> crate::Result<Vec<u8>>;
    fn decompress_raw(&self, input: &[u8]) -> crate::Result<Vec<u8>>;

    /// Applies the shrink-or-pass-through policy (spec.md §4.3). Returns the
    /// tag that was actually applied alongside the encoded bytes — `NONE_TAG`
    /// whenever the pass-through path is taken — so a caller writing the tag
    /// into a frame header never stamps a tag that decompression can't
    /// undo (spec.md §4.1, §8 `decode(encode(R)) == R`).
    fn compress(&self, input: &[u8]) -> crate::Result<(u8, Vec<u8>)> {
        if input.len() < self.threshold() {
            return Ok((NONE_TAG, input.to_vec()));
        }
        match self.compress_raw(input) {
            Ok(out) if out.len() < input.len() => Ok((self.tag(), out)),
            Ok(_) => Ok((NONE_TAG, input.to_vec())),
            Err(e) => {
                warn!(
                    "compressor {} failed, falling back to uncompressed: {e}",
                    self.name()
                );
                Ok((NONE_TAG, input.to_vec()))
            }
        }
    }

    fn decompress(&self, input: &[u8]) -> crate::Result<Vec<u8>> {
        self.decompress_raw(input)
    }
}

pub struct CompressorRegistry {
    compressors: HashMap<u8, Box<dyn Compressor>>,
}

impl CompressorRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            compressors: HashMap::new(),
        };
        registry.register(Box::new(none::NoneCompressor));
        registry.register(Box::new(gzip::GzipCompressor));
        registry.register(Box::new(fastlz::FastLzCompressor));
        registry.register(Box::new(lz4compat::Lz4Compressor));
        registry
    }

    pub fn register(&mut self, compressor: Box<dyn Compressor>) {
        self.compressors.insert(compressor.tag(), compressor);
    }

    pub fn get(&self, tag: u8) -> crate::Result<&dyn Compressor> {
        self.compressors
            .get(&tag)
            .map(|c| c.as_ref())
            .ok_or(RpcError::UnknownCompressor(tag))
    }
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_registered_compressor_round_trips() {
        let registry = CompressorRegistry::with_defaults();
        let payload = b"the quick brown fox jumps over the lazy dog ".repeat(200);
        for tag in [NONE_TAG, GZIP_TAG, FASTLZ_TAG, LZ4_TAG] {
            let compressor = registry.get(tag).unwrap();
            let (applied_tag, compressed) = compressor.compress(&payload).unwrap();
            let applied = registry.get(applied_tag).unwrap();
            let decompressed = applied.decompress(&compressed).unwrap();
            assert_eq!(decompressed, payload, "tag {tag} round trip failed");
        }
    }

    #[test]
    fn below_threshold_payload_is_passed_through_as_none_tag() {
        let registry = CompressorRegistry::with_defaults();
        let gzip = registry.get(GZIP_TAG).unwrap();
        let tiny = b"hi";
        let (tag, out) = gzip.compress(tiny).unwrap();
        assert_eq!(tag, NONE_TAG);
        assert_eq!(out, tiny);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let registry = CompressorRegistry::with_defaults();
        assert!(matches!(
            registry.get(200),
            Err(RpcError::UnknownCompressor(200))
        ));
    }
}
