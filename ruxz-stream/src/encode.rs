//! Single-shot .xz stream encoding.
//!
//! Produces a complete, bit-exact Stream (Header, Blocks, Index, Footer)
//! from a byte slice, framing the payload as uncompressed LZMA2 chunks.
//! This is not a compressor: output is slightly larger than the input. It
//! exists so streams can be produced without one, and it feeds the decoder
//! test suites.

use crate::block::header::{block_header_encode, block_header_size, BlockOptions};
use crate::filter::{lzma2_dict_size_decode, lzma2_dict_size_encode, Filter, FilterId, FilterOptions};
use crate::header::{stream_footer_encode, stream_header_encode, StreamFlags};
use crate::index::Index;
use ruxz_core::check::{CheckKind, CheckState};
use ruxz_core::error::Result;
use ruxz_lzma::{lzma2_encode_uncompressed, DICT_SIZE_MIN};

/// Options for [`stream_buffer_encode`].
#[derive(Debug, Clone, Copy)]
pub struct StreamEncodeOptions {
    /// Check kind for every Block.
    pub check: CheckKind,
    /// Maximum uncompressed bytes per Block; `None` puts everything in a
    /// single Block.
    pub block_size: Option<usize>,
}

impl Default for StreamEncodeOptions {
    fn default() -> Self {
        Self {
            check: CheckKind::Crc32,
            block_size: None,
        }
    }
}

impl StreamEncodeOptions {
    /// Use `check` for every Block.
    #[must_use]
    pub fn check(mut self, check: CheckKind) -> Self {
        self.check = check;
        self
    }

    /// Split the payload into Blocks of at most `size` uncompressed bytes.
    #[must_use]
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = Some(size.max(1));
        self
    }
}

/// Encode `data` into a complete .xz Stream with default options.
pub fn stream_buffer_encode(data: &[u8], check: CheckKind) -> Result<Vec<u8>> {
    stream_buffer_encode_opts(data, StreamEncodeOptions::default().check(check))
}

/// Encode `data` into a complete .xz Stream.
pub fn stream_buffer_encode_opts(data: &[u8], options: StreamEncodeOptions) -> Result<Vec<u8>> {
    let flags = StreamFlags::new(options.check);
    let mut out = Vec::with_capacity(data.len() + 128);
    out.extend_from_slice(&stream_header_encode(flags)?);

    let mut index = Index::new();

    let block_size = options.block_size.unwrap_or(data.len().max(1));
    let blocks: Vec<&[u8]> = if data.is_empty() {
        Vec::new()
    } else {
        data.chunks(block_size).collect()
    };

    for block_data in blocks {
        // A small dictionary suffices: uncompressed chunks only reference
        // the window for format bookkeeping, never for matches.
        let dict_size = lzma2_dict_size_decode(lzma2_dict_size_encode(DICT_SIZE_MIN)?)?;

        let mut payload = Vec::new();
        lzma2_encode_uncompressed(block_data, &mut payload);

        let mut block_options = BlockOptions {
            version: 1,
            check: options.check,
            header_size: 0,
            compressed_size: Some(payload.len() as u64),
            uncompressed_size: Some(block_data.len() as u64),
            ignore_check: false,
            filters: vec![Filter {
                id: FilterId::Lzma2,
                options: FilterOptions::Lzma2 { dict_size },
            }],
        };
        block_options.header_size = block_header_size(&block_options)?;

        block_header_encode(&block_options, &mut out)?;
        out.extend_from_slice(&payload);

        let padding = (4 - payload.len() % 4) % 4;
        out.extend(std::iter::repeat(0x00).take(padding));

        let mut check_state = CheckState::new(options.check);
        check_state.update(block_data);
        out.extend_from_slice(check_state.finish().as_slice());

        let unpadded = block_options
            .unpadded_size()
            .ok_or_else(|| ruxz_core::error::Error::prog("block sizes left the VLI range"))?;
        index.append(unpadded, block_data.len() as u64)?;
    }

    index.encode(&mut out)?;

    let footer_flags = StreamFlags {
        check: options.check,
        backward_size: Some(index.index_size()),
    };
    out.extend_from_slice(&stream_footer_encode(footer_flags)?);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{stream_footer_decode, stream_header_decode, STREAM_HEADER_SIZE};

    #[test]
    fn test_empty_stream_is_minimal() {
        let encoded = stream_buffer_encode(&[], CheckKind::Crc32).unwrap();
        assert_eq!(
            encoded,
            vec![
                0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, 0x00, 0x01, 0x69, 0x22, 0xDE, 0x36, // header
                0x00, 0x00, 0x00, 0x00, 0x1C, 0xDF, 0x44, 0x21, // empty index
                0x90, 0x42, 0x99, 0x0D, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01, 0x59, 0x5A, // footer
            ]
        );
    }

    #[test]
    fn test_framing_is_consistent() {
        let data = vec![0x42u8; 10_000];
        let encoded =
            stream_buffer_encode_opts(&data, StreamEncodeOptions::default().block_size(1 << 10))
                .unwrap();

        let header: [u8; STREAM_HEADER_SIZE] =
            encoded[..STREAM_HEADER_SIZE].try_into().unwrap();
        let header_flags = stream_header_decode(&header).unwrap();

        let footer: [u8; STREAM_HEADER_SIZE] =
            encoded[encoded.len() - STREAM_HEADER_SIZE..].try_into().unwrap();
        let footer_flags = stream_footer_decode(&footer).unwrap();

        assert_eq!(header_flags.check, footer_flags.check);

        // The backward size locates the Index.
        let backward = footer_flags.backward_size.unwrap() as usize;
        let index_start = encoded.len() - STREAM_HEADER_SIZE - backward;
        let index = Index::decode(&encoded[index_start..encoded.len() - STREAM_HEADER_SIZE])
            .unwrap();
        assert_eq!(index.record_count(), 10); // 10000 bytes / 1 KiB blocks
        assert_eq!(index.total_uncompressed_size(), 10_000);
    }

    #[test]
    fn test_stream_sizes_multiple_of_four() {
        for len in [0usize, 1, 2, 3, 4, 100, 65537] {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let encoded = stream_buffer_encode(&data, CheckKind::Crc64).unwrap();
            assert_eq!(encoded.len() % 4, 0, "stream length for payload {len}");
        }
    }
}
