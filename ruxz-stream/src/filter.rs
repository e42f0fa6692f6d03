//! Filter registry: wire IDs, property codecs, memory estimates, chain
//! rules, and construction of the decode chain for a Block.
//!
//! A chain holds one to four filters. The last must be a compression
//! filter: LZMA2, or LZMA1 carrying one raw stream terminated by the
//! end-of-payload marker. Up to three delta/BCJ filters may precede it.

use ruxz_core::error::{Error, Result};
use ruxz_core::traits::FilterDecode;
use ruxz_lzma::{
    bcj_mem_usage, delta_mem_usage, lzma2_decoder_mem_usage, BcjDecoder, BcjKind, DeltaDecoder,
    Lzma1Decoder, Lzma2Decoder, LzmaProps,
};

/// Maximum number of filters in a chain.
pub const FILTERS_MAX: usize = 4;

/// Fixed per-chain overhead added to every memory estimate.
pub const MEMUSAGE_BASE: u64 = 1 << 15;

/// Wire IDs of the known filters.
pub mod ids {
    /// Delta filter.
    pub const DELTA: u64 = 0x03;
    /// x86 BCJ filter.
    pub const X86: u64 = 0x04;
    /// PowerPC BCJ filter.
    pub const POWERPC: u64 = 0x05;
    /// IA-64 BCJ filter.
    pub const IA64: u64 = 0x06;
    /// ARM BCJ filter.
    pub const ARM: u64 = 0x07;
    /// ARM-Thumb BCJ filter.
    pub const ARMTHUMB: u64 = 0x08;
    /// SPARC BCJ filter.
    pub const SPARC: u64 = 0x09;
    /// ARM64 BCJ filter.
    pub const ARM64: u64 = 0x0A;
    /// LZMA1 (one raw stream, ended by the end-of-payload marker).
    pub const LZMA1: u64 = 0x4000000000000001;
    /// LZMA2.
    pub const LZMA2: u64 = 0x21;
}

/// A known filter ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterId {
    /// Delta filter.
    Delta,
    /// x86 branch converter.
    X86,
    /// PowerPC branch converter.
    PowerPc,
    /// IA-64 branch converter.
    Ia64,
    /// ARM branch converter.
    Arm,
    /// ARM-Thumb branch converter.
    ArmThumb,
    /// SPARC branch converter.
    Sparc,
    /// ARM64 branch converter.
    Arm64,
    /// LZMA1 compression.
    Lzma1,
    /// LZMA2 compression.
    Lzma2,
}

impl FilterId {
    /// Look up a wire ID.
    pub fn from_wire(id: u64) -> Result<Self> {
        match id {
            ids::DELTA => Ok(Self::Delta),
            ids::X86 => Ok(Self::X86),
            ids::POWERPC => Ok(Self::PowerPc),
            ids::IA64 => Ok(Self::Ia64),
            ids::ARM => Ok(Self::Arm),
            ids::ARMTHUMB => Ok(Self::ArmThumb),
            ids::SPARC => Ok(Self::Sparc),
            ids::ARM64 => Ok(Self::Arm64),
            ids::LZMA1 => Ok(Self::Lzma1),
            ids::LZMA2 => Ok(Self::Lzma2),
            _ => Err(Error::options(format!("unknown filter id 0x{id:X}"))),
        }
    }

    /// The wire ID.
    pub fn wire(self) -> u64 {
        match self {
            Self::Delta => ids::DELTA,
            Self::X86 => ids::X86,
            Self::PowerPc => ids::POWERPC,
            Self::Ia64 => ids::IA64,
            Self::Arm => ids::ARM,
            Self::ArmThumb => ids::ARMTHUMB,
            Self::Sparc => ids::SPARC,
            Self::Arm64 => ids::ARM64,
            Self::Lzma1 => ids::LZMA1,
            Self::Lzma2 => ids::LZMA2,
        }
    }

    /// True for the compression filters that may only terminate a chain.
    pub fn is_compression(self) -> bool {
        matches!(self, Self::Lzma1 | Self::Lzma2)
    }

    /// The BCJ architecture, if this is a branch converter.
    pub fn bcj_kind(self) -> Option<BcjKind> {
        match self {
            Self::X86 => Some(BcjKind::X86),
            Self::PowerPc => Some(BcjKind::PowerPc),
            Self::Ia64 => Some(BcjKind::Ia64),
            Self::Arm => Some(BcjKind::Arm),
            Self::ArmThumb => Some(BcjKind::ArmThumb),
            Self::Sparc => Some(BcjKind::Sparc),
            Self::Arm64 => Some(BcjKind::Arm64),
            _ => None,
        }
    }
}

/// Decoded filter options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOptions {
    /// LZMA2: dictionary size in bytes.
    Lzma2 {
        /// Dictionary size in bytes.
        dict_size: u32,
    },
    /// LZMA1: dictionary size and literal/position parameters.
    Lzma1 {
        /// Dictionary size in bytes.
        dict_size: u32,
        /// Literal context bits.
        lc: u32,
        /// Literal position bits.
        lp: u32,
        /// Position bits.
        pb: u32,
    },
    /// Delta: byte distance, 1..=256.
    Delta {
        /// Distance between subtracted bytes.
        distance: u32,
    },
    /// BCJ: optional start offset, aligned to the converter.
    Bcj {
        /// Stream position the converter assumes for its first byte.
        start_offset: Option<u32>,
    },
}

/// One element of a filter chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    /// The filter ID.
    pub id: FilterId,
    /// Its decoded options.
    pub options: FilterOptions,
}

impl Filter {
    /// Size of the encoded properties field.
    pub fn props_size(&self) -> usize {
        match &self.options {
            FilterOptions::Lzma2 { .. } | FilterOptions::Delta { .. } => 1,
            FilterOptions::Lzma1 { .. } => 5,
            FilterOptions::Bcj { start_offset } => {
                if start_offset.is_some() {
                    4
                } else {
                    0
                }
            }
        }
    }

    /// Append the bit-exact property bytes.
    pub fn props_encode(&self, out: &mut Vec<u8>) -> Result<()> {
        match &self.options {
            FilterOptions::Lzma2 { dict_size } => {
                out.push(lzma2_dict_size_encode(*dict_size)?);
            }
            FilterOptions::Lzma1 { dict_size, lc, lp, pb } => {
                if *lc > 8 || *lp > 4 || *pb > 4 || lc + lp > 4 {
                    return Err(Error::options("invalid LZMA1 properties"));
                }
                let props = LzmaProps { lc: *lc, lp: *lp, pb: *pb };
                out.push(props.to_byte());
                out.extend_from_slice(&dict_size.to_le_bytes());
            }
            FilterOptions::Delta { distance } => {
                if !(1..=256).contains(distance) {
                    return Err(Error::options(format!("delta distance {distance} out of range")));
                }
                out.push((*distance - 1) as u8);
            }
            FilterOptions::Bcj { start_offset } => {
                if let Some(offset) = start_offset {
                    let alignment = self
                        .id
                        .bcj_kind()
                        .map_or(1, BcjKind::alignment);
                    if offset % alignment != 0 {
                        return Err(Error::options(format!(
                            "start offset {offset} is not a multiple of {alignment}"
                        )));
                    }
                    out.extend_from_slice(&offset.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    /// Decode the property bytes for a filter ID.
    pub fn props_decode(id: FilterId, props: &[u8]) -> Result<Self> {
        let options = match id {
            FilterId::Lzma2 => {
                if props.len() != 1 {
                    return Err(Error::options("LZMA2 properties must be one byte"));
                }
                FilterOptions::Lzma2 {
                    dict_size: lzma2_dict_size_decode(props[0])?,
                }
            }
            FilterId::Lzma1 => {
                if props.len() != 5 {
                    return Err(Error::options("LZMA1 properties must be five bytes"));
                }
                let parsed = LzmaProps::from_byte(props[0])
                    .map_err(|_| Error::options("invalid LZMA1 properties byte"))?;
                FilterOptions::Lzma1 {
                    dict_size: u32::from_le_bytes([props[1], props[2], props[3], props[4]]),
                    lc: parsed.lc,
                    lp: parsed.lp,
                    pb: parsed.pb,
                }
            }
            FilterId::Delta => {
                if props.len() != 1 {
                    return Err(Error::options("delta properties must be one byte"));
                }
                FilterOptions::Delta {
                    distance: u32::from(props[0]) + 1,
                }
            }
            _ => match props.len() {
                0 => FilterOptions::Bcj { start_offset: None },
                4 => {
                    let offset = u32::from_le_bytes([props[0], props[1], props[2], props[3]]);
                    let alignment = id.bcj_kind().map_or(1, BcjKind::alignment);
                    if offset % alignment != 0 {
                        return Err(Error::options(format!(
                            "start offset {offset} is not a multiple of {alignment}"
                        )));
                    }
                    FilterOptions::Bcj {
                        start_offset: Some(offset),
                    }
                }
                n => {
                    return Err(Error::options(format!(
                        "branch filter properties must be 0 or 4 bytes, got {n}"
                    )))
                }
            },
        };

        Ok(Self { id, options })
    }

    /// Decoder memory estimate for this filter alone.
    pub fn mem_usage(&self) -> u64 {
        match &self.options {
            FilterOptions::Lzma2 { dict_size } | FilterOptions::Lzma1 { dict_size, .. } => {
                lzma2_decoder_mem_usage(*dict_size)
            }
            FilterOptions::Delta { .. } => delta_mem_usage(),
            FilterOptions::Bcj { .. } => bcj_mem_usage(),
        }
    }
}

/// Decode the 6-bit LZMA2 dictionary-size byte.
pub fn lzma2_dict_size_decode(byte: u8) -> Result<u32> {
    if byte > 40 {
        return Err(Error::options(format!("invalid dictionary size code {byte}")));
    }
    if byte == 40 {
        return Ok(u32::MAX);
    }
    Ok((2 | u32::from(byte) & 1) << (byte / 2 + 11))
}

/// Encode a dictionary size as the smallest representable value that is
/// at least `size`.
pub fn lzma2_dict_size_encode(size: u32) -> Result<u8> {
    if size < ruxz_lzma::DICT_SIZE_MIN {
        return Err(Error::options(format!("dictionary size {size} is below the minimum")));
    }
    for byte in 0..40u8 {
        if lzma2_dict_size_decode(byte)? >= size {
            return Ok(byte);
        }
    }
    Ok(40)
}

/// Validate chain shape: 1..=4 filters, compression exactly at the end,
/// only non-last kinds before it, no duplicate IDs.
pub fn validate_chain(filters: &[Filter]) -> Result<()> {
    if filters.is_empty() || filters.len() > FILTERS_MAX {
        return Err(Error::options(format!(
            "a filter chain holds 1 to {FILTERS_MAX} filters, got {}",
            filters.len()
        )));
    }

    let last = filters.len() - 1;
    for (i, filter) in filters.iter().enumerate() {
        if (i == last) != filter.id.is_compression() {
            return Err(Error::options(
                "the compression filter must be exactly the last in the chain",
            ));
        }
        if filters[..i].iter().any(|f| f.id == filter.id) {
            return Err(Error::options("duplicate filter in chain"));
        }
    }

    Ok(())
}

/// Total decoder memory estimate for a chain.
pub fn chain_mem_usage(filters: &[Filter]) -> u64 {
    MEMUSAGE_BASE + filters.iter().map(Filter::mem_usage).sum::<u64>()
}

/// Build the decode chain for a validated filter list. The returned stage
/// is the head: driving it pulls compressed bytes through every filter.
///
/// `compressed_size` is the Block's declared payload size. LZMA2 frames
/// itself and ignores it; a raw LZMA1 stream has no framing, so for it the
/// size must be declared.
pub fn build_chain(
    filters: &[Filter],
    compressed_size: Option<u64>,
) -> Result<Box<dyn FilterDecode>> {
    validate_chain(filters)?;

    let last = filters.len() - 1;
    let mut stage: Box<dyn FilterDecode> = match &filters[last].options {
        FilterOptions::Lzma2 { dict_size } => Box::new(Lzma2Decoder::new(*dict_size)),
        FilterOptions::Lzma1 { dict_size, lc, lp, pb } => {
            let size = compressed_size.ok_or_else(|| {
                Error::options("LZMA1 needs the compressed size declared in the block header")
            })?;
            let props = LzmaProps { lc: *lc, lp: *lp, pb: *pb };
            Box::new(Lzma1Decoder::new(props, *dict_size, size)?)
        }
        _ => return Err(Error::options("chain does not end in a compression filter")),
    };

    for filter in filters[..last].iter().rev() {
        stage = match &filter.options {
            FilterOptions::Delta { distance } => Box::new(DeltaDecoder::new(stage, *distance)),
            FilterOptions::Bcj { start_offset } => {
                let kind = filter
                    .id
                    .bcj_kind()
                    .ok_or_else(|| Error::options("non-last filter must be delta or BCJ"))?;
                Box::new(BcjDecoder::new(stage, kind, start_offset.unwrap_or(0)))
            }
            _ => return Err(Error::options("non-last filter must be delta or BCJ")),
        };
    }

    Ok(stage)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lzma2(dict_size: u32) -> Filter {
        Filter {
            id: FilterId::Lzma2,
            options: FilterOptions::Lzma2 { dict_size },
        }
    }

    #[test]
    fn test_dict_size_codec() {
        assert_eq!(lzma2_dict_size_decode(0).unwrap(), 1 << 12);
        assert_eq!(lzma2_dict_size_decode(1).unwrap(), 3 << 11);
        assert_eq!(lzma2_dict_size_decode(2).unwrap(), 1 << 13);
        assert_eq!(lzma2_dict_size_decode(40).unwrap(), u32::MAX);
        assert!(lzma2_dict_size_decode(41).is_err());

        // Encoding picks the smallest size that covers the request.
        assert_eq!(lzma2_dict_size_encode(1 << 12).unwrap(), 0);
        assert_eq!(lzma2_dict_size_encode((1 << 12) + 1).unwrap(), 1);
        assert_eq!(lzma2_dict_size_encode(1 << 26).unwrap(), 28);
        assert_eq!(lzma2_dict_size_encode(u32::MAX).unwrap(), 40);
    }

    #[test]
    fn test_dict_size_roundtrip_all_codes() {
        for code in 0..=40u8 {
            let size = lzma2_dict_size_decode(code).unwrap();
            if size >= ruxz_lzma::DICT_SIZE_MIN {
                assert_eq!(lzma2_dict_size_encode(size).unwrap(), code);
            }
        }
    }

    #[test]
    fn test_props_roundtrip() {
        let filters = [
            lzma2(1 << 20),
            Filter {
                id: FilterId::Delta,
                options: FilterOptions::Delta { distance: 4 },
            },
            Filter {
                id: FilterId::Arm64,
                options: FilterOptions::Bcj {
                    start_offset: Some(64),
                },
            },
            Filter {
                id: FilterId::X86,
                options: FilterOptions::Bcj { start_offset: None },
            },
            Filter {
                id: FilterId::Lzma1,
                options: FilterOptions::Lzma1 {
                    dict_size: 1 << 23,
                    lc: 3,
                    lp: 0,
                    pb: 2,
                },
            },
        ];

        for filter in &filters {
            let mut props = Vec::new();
            filter.props_encode(&mut props).unwrap();
            assert_eq!(props.len(), filter.props_size());

            let decoded = Filter::props_decode(filter.id, &props).unwrap();
            match (&decoded.options, &filter.options) {
                // The dictionary size snaps up to the representable grid.
                (FilterOptions::Lzma2 { dict_size: a }, FilterOptions::Lzma2 { dict_size: b }) => {
                    assert!(*a >= *b);
                }
                (a, b) => assert_eq!(a, b),
            }
        }
    }

    #[test]
    fn test_unknown_filter_id() {
        assert!(matches!(FilterId::from_wire(0x7F), Err(Error::Options(_))));
    }

    #[test]
    fn test_misaligned_start_offset() {
        let err = Filter::props_decode(FilterId::Arm64, &[2, 0, 0, 0]);
        assert!(matches!(err, Err(Error::Options(_))));
    }

    #[test]
    fn test_chain_validation() {
        assert!(validate_chain(&[lzma2(1 << 16)]).is_ok());

        let delta = Filter {
            id: FilterId::Delta,
            options: FilterOptions::Delta { distance: 1 },
        };

        assert!(validate_chain(&[delta.clone(), lzma2(1 << 16)]).is_ok());
        // Compression filter not last.
        assert!(validate_chain(&[lzma2(1 << 16), delta.clone()]).is_err());
        // Empty chain.
        assert!(validate_chain(&[]).is_err());
        // Duplicates.
        assert!(validate_chain(&[delta.clone(), delta.clone(), lzma2(1 << 16)]).is_err());
        // Too long.
        let x86 = Filter {
            id: FilterId::X86,
            options: FilterOptions::Bcj { start_offset: None },
        };
        let arm = Filter {
            id: FilterId::Arm,
            options: FilterOptions::Bcj { start_offset: None },
        };
        let sparc = Filter {
            id: FilterId::Sparc,
            options: FilterOptions::Bcj { start_offset: None },
        };
        assert!(validate_chain(&[delta.clone(), x86.clone(), arm.clone(), lzma2(1 << 16)]).is_ok());
        assert!(
            validate_chain(&[delta, x86, arm, sparc, lzma2(1 << 16)]).is_err()
        );
    }

    #[test]
    fn test_lzma2_chain_ignores_compressed_size() {
        assert!(build_chain(&[lzma2(1 << 16)], None).is_ok());
        assert!(build_chain(&[lzma2(1 << 16)], Some(100)).is_ok());
    }

    #[test]
    fn test_lzma1_chain_requires_compressed_size() {
        let chain = [Filter {
            id: FilterId::Lzma1,
            options: FilterOptions::Lzma1 {
                dict_size: 1 << 16,
                lc: 3,
                lp: 0,
                pb: 2,
            },
        }];
        // Without a declared payload size the raw stream has no bounds.
        assert!(matches!(build_chain(&chain, None), Err(Error::Options(_))));
        assert!(build_chain(&chain, Some(100)).is_ok());
    }

    #[test]
    fn test_chain_mem_usage_grows_with_dict() {
        let small = chain_mem_usage(&[lzma2(1 << 16)]);
        let large = chain_mem_usage(&[lzma2(1 << 26)]);
        assert!(small >= MEMUSAGE_BASE);
        assert!(large > small);
    }
}
