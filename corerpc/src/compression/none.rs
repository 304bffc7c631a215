use super::Compressor;

pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn tag(&self) -> u8 {
        super::NONE_TAG
    }

    fn name(&self) -> &'static str {
        "none"
    }

    fn threshold(&self) -> usize {
        usize::MAX
    }

    fn compress_raw(&self, input: &[u8]) -> crate::Result<Vec<u8>> {
        Ok(input.to_vec())
    }

    fn decompress_raw(&self, input: &[u8]) -> crate::Result<Vec<u8>> {
        Ok(input.to_vec())
    }

    fn compress(&self, input: &[u8]) -> crate::Result<Vec<u8>> {
        Ok(input.to_vec())
    }
}
