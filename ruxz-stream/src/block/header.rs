//! Block Header codec, including the per-filter flag records.
//!
//! The first header byte encodes the total header size as
//! `(byte + 1) * 4`; a zero byte in that position is not a Block Header at
//! all but the start of the Index. A flag byte, optional VLI sizes, the
//! filter-flag records, zero padding and a CRC32 follow.

use crate::filter::{Filter, FilterId, FILTERS_MAX};
use ruxz_core::check::CheckKind;
use ruxz_core::crc::Crc32;
use ruxz_core::error::{Error, Result};
use ruxz_core::vli::{vli_ceil4, vli_decode, vli_encode, vli_size, VLI_MAX};

/// Smallest encoded Block Header.
pub const BLOCK_HEADER_SIZE_MIN: u32 = 8;

/// Largest encoded Block Header.
pub const BLOCK_HEADER_SIZE_MAX: u32 = 1024;

/// Flag bit: compressed size field present.
const FLAG_COMPRESSED_SIZE: u8 = 0x40;

/// Flag bit: uncompressed size field present.
const FLAG_UNCOMPRESSED_SIZE: u8 = 0x80;

/// Reserved flag bits that must be zero.
const FLAG_RESERVED: u8 = 0x3C;

/// Everything needed to decode one Block.
#[derive(Debug, Clone)]
pub struct BlockOptions {
    /// Format version; 1 enables honoring `ignore_check`.
    pub version: u8,
    /// Check kind copied from the Stream Flags.
    pub check: CheckKind,
    /// Encoded header size in bytes, a multiple of 4 in
    /// [`BLOCK_HEADER_SIZE_MIN`, `BLOCK_HEADER_SIZE_MAX`].
    pub header_size: u32,
    /// Compressed payload size, when declared in the header.
    pub compressed_size: Option<u64>,
    /// Uncompressed payload size, when declared in the header.
    pub uncompressed_size: Option<u64>,
    /// Skip verification of the trailing check.
    pub ignore_check: bool,
    /// The filter chain, last element the compression filter.
    pub filters: Vec<Filter>,
}

impl BlockOptions {
    /// Unpadded size of the whole Block (header + compressed payload +
    /// check, no Block Padding). `None` while the compressed size is
    /// unknown or the sum leaves the VLI range.
    pub fn unpadded_size(&self) -> Option<u64> {
        let compressed = self.compressed_size?;
        let sum = u64::from(self.header_size)
            .checked_add(compressed)?
            .checked_add(self.check.size() as u64)?;
        (sum <= VLI_MAX).then_some(sum)
    }

    /// Total on-disk size of the Block including Block Padding.
    pub fn total_size(&self) -> Option<u64> {
        self.unpadded_size().map(vli_ceil4)
    }
}

/// Derive the header size byte from the first header byte.
pub fn block_header_size_decode(byte: u8) -> u32 {
    (u32::from(byte) + 1) * 4
}

/// Compute the smallest legal `header_size` for the given options.
pub fn block_header_size(options: &BlockOptions) -> Result<u32> {
    let mut size = 1 + 1 + 4; // size byte, flag byte, CRC32

    if let Some(compressed) = options.compressed_size {
        size += vli_size(compressed)
            .ok_or_else(|| Error::prog("compressed size out of VLI range"))? as u32;
    }
    if let Some(uncompressed) = options.uncompressed_size {
        size += vli_size(uncompressed)
            .ok_or_else(|| Error::prog("uncompressed size out of VLI range"))? as u32;
    }

    for filter in &options.filters {
        let props_size = filter.props_size() as u64;
        size += vli_size(filter.id.wire()).unwrap_or(9) as u32;
        size += vli_size(props_size).unwrap_or(9) as u32;
        size += props_size as u32;
    }

    let size = vli_ceil4(u64::from(size)) as u32;
    if size > BLOCK_HEADER_SIZE_MAX {
        return Err(Error::options("block header does not fit in 1024 bytes"));
    }
    Ok(size.max(BLOCK_HEADER_SIZE_MIN))
}

/// Append the encoded Block Header. `options.header_size` must be a legal
/// size at least as large as [`block_header_size`] computes.
pub fn block_header_encode(options: &BlockOptions, out: &mut Vec<u8>) -> Result<()> {
    let header_size = options.header_size;
    if header_size % 4 != 0
        || !(BLOCK_HEADER_SIZE_MIN..=BLOCK_HEADER_SIZE_MAX).contains(&header_size)
        || header_size < block_header_size(options)?
    {
        return Err(Error::prog(format!("invalid block header size {header_size}")));
    }
    if options.filters.is_empty() || options.filters.len() > FILTERS_MAX {
        return Err(Error::options("a block needs 1 to 4 filters"));
    }

    let start = out.len();
    out.push((header_size / 4 - 1) as u8);

    let mut flags = (options.filters.len() - 1) as u8;
    if options.compressed_size.is_some() {
        flags |= FLAG_COMPRESSED_SIZE;
    }
    if options.uncompressed_size.is_some() {
        flags |= FLAG_UNCOMPRESSED_SIZE;
    }
    out.push(flags);

    if let Some(compressed) = options.compressed_size {
        if compressed == 0 {
            return Err(Error::prog("compressed size cannot be zero"));
        }
        vli_encode(compressed, out)?;
    }
    if let Some(uncompressed) = options.uncompressed_size {
        vli_encode(uncompressed, out)?;
    }

    for filter in &options.filters {
        vli_encode(filter.id.wire(), out)?;
        vli_encode(filter.props_size() as u64, out)?;
        filter.props_encode(out)?;
    }

    let padded_end = start + header_size as usize - 4;
    if out.len() > padded_end {
        return Err(Error::prog("block header content overflows the declared size"));
    }
    out.resize(padded_end, 0x00);

    let crc = Crc32::compute(&out[start..padded_end]);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Decode a complete Block Header. `buf` must hold exactly the
/// `header_size` bytes implied by its first byte.
pub fn block_header_decode(buf: &[u8], check: CheckKind) -> Result<BlockOptions> {
    if buf.len() < BLOCK_HEADER_SIZE_MIN as usize
        || buf.len() != block_header_size_decode(buf[0]) as usize
    {
        return Err(Error::prog("block header buffer does not match its size byte"));
    }

    let crc_start = buf.len() - 4;
    let stored = u32::from_le_bytes([buf[crc_start], buf[crc_start + 1], buf[crc_start + 2], buf[crc_start + 3]]);
    if stored != Crc32::compute(&buf[..crc_start]) {
        return Err(Error::data("block header CRC32 mismatch"));
    }

    let flags = buf[1];
    if flags & FLAG_RESERVED != 0 {
        return Err(Error::options("reserved block header flag bits are set"));
    }
    let filter_count = usize::from(flags & 0x03) + 1;

    let body = &buf[..crc_start];
    let mut pos = 2;

    let compressed_size = if flags & FLAG_COMPRESSED_SIZE != 0 {
        let value = vli_decode(body, &mut pos)?;
        if value == 0 {
            return Err(Error::data("declared compressed size is zero"));
        }
        Some(value)
    } else {
        None
    };

    let uncompressed_size = if flags & FLAG_UNCOMPRESSED_SIZE != 0 {
        Some(vli_decode(body, &mut pos)?)
    } else {
        None
    };

    let mut filters = Vec::with_capacity(filter_count);
    for _ in 0..filter_count {
        let id = FilterId::from_wire(vli_decode(body, &mut pos)?)?;
        let props_size = vli_decode(body, &mut pos)? as usize;
        if pos + props_size > body.len() {
            return Err(Error::data("filter properties overflow the block header"));
        }
        filters.push(Filter::props_decode(id, &body[pos..pos + props_size])?);
        pos += props_size;
    }

    if body[pos..].iter().any(|b| *b != 0x00) {
        return Err(Error::options("non-zero block header padding"));
    }

    let options = BlockOptions {
        version: 1,
        check,
        header_size: buf.len() as u32,
        compressed_size,
        uncompressed_size,
        ignore_check: false,
        filters,
    };

    if let (Some(_), Some(_)) = (options.compressed_size, options.uncompressed_size) {
        if options.unpadded_size().is_none() {
            return Err(Error::data("declared block sizes leave the VLI range"));
        }
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterOptions;

    fn options(compressed: Option<u64>, uncompressed: Option<u64>) -> BlockOptions {
        let mut opts = BlockOptions {
            version: 1,
            check: CheckKind::Crc32,
            header_size: 0,
            compressed_size: compressed,
            uncompressed_size: uncompressed,
            ignore_check: false,
            filters: vec![Filter {
                id: FilterId::Lzma2,
                options: FilterOptions::Lzma2 { dict_size: 1 << 20 },
            }],
        };
        opts.header_size = block_header_size(&opts).unwrap();
        opts
    }

    fn encode(opts: &BlockOptions) -> Vec<u8> {
        let mut out = Vec::new();
        block_header_encode(opts, &mut out).unwrap();
        assert_eq!(out.len(), opts.header_size as usize);
        out
    }

    #[test]
    fn test_roundtrip_sizes_grid() {
        let candidates = [
            None,
            Some(1u64),
            Some(100),
            Some(1 << 20),
            Some(VLI_MAX / 2),
        ];
        for compressed in candidates {
            for uncompressed in candidates {
                let opts = options(compressed, uncompressed);
                let encoded = encode(&opts);
                let decoded = block_header_decode(&encoded, CheckKind::Crc32).unwrap();

                assert_eq!(decoded.compressed_size, compressed);
                assert_eq!(decoded.uncompressed_size, uncompressed);
                assert_eq!(decoded.header_size, opts.header_size);
                assert_eq!(decoded.filters.len(), 1);
            }
        }
    }

    #[test]
    fn test_roundtrip_with_chain() {
        let mut opts = options(Some(1000), Some(4000));
        opts.filters.insert(
            0,
            Filter {
                id: FilterId::Delta,
                options: FilterOptions::Delta { distance: 16 },
            },
        );
        opts.filters.insert(
            1,
            Filter {
                id: FilterId::Arm64,
                options: FilterOptions::Bcj { start_offset: Some(4096) },
            },
        );
        opts.header_size = block_header_size(&opts).unwrap();

        let encoded = encode(&opts);
        let decoded = block_header_decode(&encoded, CheckKind::Crc32).unwrap();
        assert_eq!(decoded.filters.len(), 3);
        assert_eq!(decoded.filters[0].id, FilterId::Delta);
        assert_eq!(decoded.filters[1].id, FilterId::Arm64);
        assert_eq!(decoded.filters[2].id, FilterId::Lzma2);
    }

    #[test]
    fn test_oversized_header_padding_is_allowed() {
        // An encoder may declare a larger header; the extra bytes are
        // zero padding.
        let mut opts = options(Some(10), Some(10));
        opts.header_size += 8;
        let encoded = encode(&opts);
        let decoded = block_header_decode(&encoded, CheckKind::Crc32).unwrap();
        assert_eq!(decoded.header_size, opts.header_size);
    }

    #[test]
    fn test_crc_mismatch() {
        let opts = options(Some(10), None);
        let mut encoded = encode(&opts);
        let last = encoded.len() - 1;
        encoded[last] ^= 0x40;
        assert!(matches!(
            block_header_decode(&encoded, CheckKind::Crc32),
            Err(Error::Data(_))
        ));
    }

    #[test]
    fn test_reserved_flag_bits() {
        let opts = options(Some(10), None);
        let mut encoded = encode(&opts);
        encoded[1] |= 0x04;
        let crc_start = encoded.len() - 4;
        let crc = Crc32::compute(&encoded[..crc_start]);
        encoded[crc_start..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            block_header_decode(&encoded, CheckKind::Crc32),
            Err(Error::Options(_))
        ));
    }

    #[test]
    fn test_nonzero_padding() {
        let mut opts = options(Some(10), None);
        opts.header_size += 4;
        let mut encoded = encode(&opts);
        let pad = encoded.len() - 5;
        encoded[pad] = 0x01;
        let crc_start = encoded.len() - 4;
        let crc = Crc32::compute(&encoded[..crc_start]);
        encoded[crc_start..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            block_header_decode(&encoded, CheckKind::Crc32),
            Err(Error::Options(_))
        ));
    }

    #[test]
    fn test_unknown_filter_id_is_options_error() {
        let opts = options(Some(10), None);
        let mut encoded = encode(&opts);
        // The filter record begins after size, flags and the two VLIs;
        // patch the LZMA2 id (0x21) to an unknown single-byte id.
        let idx = encoded.iter().position(|b| *b == 0x21).unwrap();
        encoded[idx] = 0x7E;
        let crc_start = encoded.len() - 4;
        let crc = Crc32::compute(&encoded[..crc_start]);
        encoded[crc_start..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            block_header_decode(&encoded, CheckKind::Crc32),
            Err(Error::Options(_))
        ));
    }

    #[test]
    fn test_index_indicator_byte_is_not_a_header() {
        // A 0x00 size byte marks the Index; the decoder must never be
        // handed such a buffer as a Block Header.
        assert_eq!(block_header_size_decode(0x00), 4);
        assert!(block_header_decode(&[0u8; 4], CheckKind::Crc32).is_err());
    }

    #[test]
    fn test_unpadded_size() {
        let opts = options(Some(100), Some(400));
        // header + compressed + 4-byte CRC32 check.
        assert_eq!(
            opts.unpadded_size(),
            Some(u64::from(opts.header_size) + 100 + 4)
        );
        assert_eq!(opts.total_size(), Some(vli_ceil4(opts.unpadded_size().unwrap())));

        let unknown = options(None, Some(400));
        assert_eq!(unknown.unpadded_size(), None);
    }
}
