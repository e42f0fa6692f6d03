//! Minimal LZMA2 encoding using uncompressed chunks.
//!
//! Every LZMA2 decoder must accept uncompressed chunks, so framing the
//! payload as stored chunks yields a valid stream without running a
//! compressor. The container layer uses this to build whole .xz streams
//! for tests and for callers that only need framing.

/// Maximum payload of one uncompressed chunk.
const UNCOMPRESSED_CHUNK_MAX: usize = 1 << 16;

/// Append an LZMA2 stream holding `data` as uncompressed chunks.
///
/// The first chunk resets the dictionary (0x01), later chunks do not
/// (0x02); the stream ends with the 0x00 marker. Empty input encodes to
/// the end marker alone.
pub fn lzma2_encode_uncompressed(data: &[u8], out: &mut Vec<u8>) {
    let mut first = true;

    for chunk in data.chunks(UNCOMPRESSED_CHUNK_MAX) {
        out.push(if first { 0x01 } else { 0x02 });
        first = false;

        let size = (chunk.len() - 1) as u16;
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(chunk);
    }

    out.push(0x00);
}

/// Worst-case encoded size for `len` payload bytes.
pub fn lzma2_bound_uncompressed(len: usize) -> usize {
    let chunks = len.div_ceil(UNCOMPRESSED_CHUNK_MAX).max(1);
    len + chunks * 3 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lzma2::Lzma2Decoder;
    use ruxz_core::traits::{DecodeStatus, FilterDecode};

    fn decode_all(data: &[u8], expected_len: usize) -> Vec<u8> {
        let mut decoder = Lzma2Decoder::new(1 << 16);
        let mut out = vec![0u8; expected_len + 8];
        let mut in_pos = 0;
        let mut out_pos = 0;
        let status = decoder
            .decode(data, &mut in_pos, &mut out, &mut out_pos, true)
            .unwrap();
        assert_eq!(status, DecodeStatus::Finished);
        out.truncate(out_pos);
        out
    }

    #[test]
    fn test_empty() {
        let mut encoded = Vec::new();
        lzma2_encode_uncompressed(&[], &mut encoded);
        assert_eq!(encoded, vec![0x00]);
        assert_eq!(decode_all(&encoded, 0), Vec::<u8>::new());
    }

    #[test]
    fn test_roundtrip_various_sizes() {
        for size in [1usize, 2, 255, 4096, UNCOMPRESSED_CHUNK_MAX, UNCOMPRESSED_CHUNK_MAX + 1, 200_000] {
            let data: Vec<u8> = (0..size).map(|i| (i * 131 % 251) as u8).collect();
            let mut encoded = Vec::new();
            lzma2_encode_uncompressed(&data, &mut encoded);
            assert!(encoded.len() <= lzma2_bound_uncompressed(size));
            assert_eq!(decode_all(&encoded, size), data, "size {size}");
        }
    }
}
