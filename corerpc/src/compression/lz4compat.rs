//! LZ4-family compressor, tag 3, threshold 256 bytes (spec.md §4.3). Carries
//! a 4-byte big-endian original-length prefix ahead of the compressed bytes,
//! using the same `lz4`/`liblz4` FFI calls the teacher already links
//! (`LZ4_compress_default` / `LZ4_decompress_safe`).

use crate::RpcError;

use super::Compressor;

pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn tag(&self) -> u8 {
        super::LZ4_TAG
    }

    fn name(&self) -> &'static str {
        "lz4"
    }

    fn threshold(&self) -> usize {
        256
    }

    fn compress_raw(&self, input: &[u8]) -> crate::Result<Vec<u8>> {
        #[cfg(feature = "compression-lz4")]
        {
            let mut compressed =
                Vec::<u8>::with_capacity(input.len() + (input.len() / 255) + 16 + 1);
            let out_len = unsafe {
                lz4::liblz4::LZ4_compress_default(
                    input.as_ptr() as *const i8,
                    compressed.as_mut_ptr() as *mut i8,
                    input.len() as i32,
                    compressed.capacity() as i32,
                )
            };
            if out_len <= 0 {
                return Err(RpcError::CompressionError(
                    "lz4 compression failed".to_string(),
                ));
            }
            unsafe { compressed.set_len(out_len as usize) };

            let mut out = Vec::with_capacity(4 + compressed.len());
            out.extend_from_slice(&(input.len() as u32).to_be_bytes());
            out.extend_from_slice(&compressed);
            Ok(out)
        }
        #[cfg(not(feature = "compression-lz4"))]
        {
            let _ = input;
            Err(RpcError::CompressionError(
                "lz4 support not compiled in (enable the `compression-lz4` feature)".to_string(),
            ))
        }
    }

    fn decompress_raw(&self, input: &[u8]) -> crate::Result<Vec<u8>> {
        #[cfg(feature = "compression-lz4")]
        {
            if input.len() < 4 {
                return Err(RpcError::DecodeError(
                    "lz4 frame missing length prefix".to_string(),
                ));
            }
            let original_len = u32::from_be_bytes(input[0..4].try_into().unwrap()) as usize;
            let body = &input[4..];
            let mut output = Vec::with_capacity(original_len);
            let out_len = unsafe {
                lz4::liblz4::LZ4_decompress_safe(
                    body.as_ptr() as *const i8,
                    output.as_mut_ptr() as *mut i8,
                    body.len() as i32,
                    output.capacity() as i32,
                )
            };
            if out_len < 0 {
                return Err(RpcError::DecodeError("malformed lz4 frame".to_string()));
            }
            unsafe { output.set_len(out_len as usize) };
            Ok(output)
        }
        #[cfg(not(feature = "compression-lz4"))]
        {
            let _ = input;
            Err(RpcError::DecodeError(
                "lz4 support not compiled in (enable the `compression-lz4` feature)".to_string(),
            ))
        }
    }
}
