//! Stream Header and Stream Footer codec.
//!
//! Both structures are twelve bytes. The header is magic ∥ flags ∥
//! CRC32(flags); the footer is CRC32 ∥ backward-size ∥ flags ∥ magic, where
//! the backward size locates the Index from the end of the Stream.

use ruxz_core::check::CheckKind;
use ruxz_core::crc::Crc32;
use ruxz_core::error::{Error, Result};

/// Size of the Stream Header and Stream Footer.
pub const STREAM_HEADER_SIZE: usize = 12;

/// Stream Header magic bytes.
pub const HEADER_MAGIC: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];

/// Stream Footer magic bytes.
pub const FOOTER_MAGIC: [u8; 2] = [0x59, 0x5A];

/// Smallest valid backward size.
pub const BACKWARD_SIZE_MIN: u64 = 4;

/// Largest valid backward size.
pub const BACKWARD_SIZE_MAX: u64 = 1 << 34;

/// Decoded Stream Flags, plus the backward size when they came from a
/// Stream Footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFlags {
    /// The integrity-check kind for every Block of the Stream.
    pub check: CheckKind,
    /// Size of the Index field; only present after footer decoding and
    /// before footer encoding.
    pub backward_size: Option<u64>,
}

impl StreamFlags {
    /// Flags carrying just a check kind.
    pub fn new(check: CheckKind) -> Self {
        Self {
            check,
            backward_size: None,
        }
    }

    fn encode_flag_bytes(self) -> [u8; 2] {
        [0x00, self.check.to_id()]
    }

    fn decode_flag_bytes(bytes: [u8; 2]) -> Result<Self> {
        if bytes[0] != 0x00 || bytes[1] & 0xF0 != 0 {
            return Err(Error::options("reserved stream flag bits are set"));
        }
        Ok(Self {
            check: CheckKind::from_id(bytes[1] & 0x0F)?,
            backward_size: None,
        })
    }
}

/// Encode a Stream Header.
pub fn stream_header_encode(flags: StreamFlags) -> Result<[u8; STREAM_HEADER_SIZE]> {
    let mut out = [0u8; STREAM_HEADER_SIZE];
    out[..6].copy_from_slice(&HEADER_MAGIC);
    out[6..8].copy_from_slice(&flags.encode_flag_bytes());
    let crc = Crc32::compute(&out[6..8]);
    out[8..12].copy_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Decode a Stream Header.
///
/// Error precedence is magic (`Format`), then CRC (`Data`), then reserved
/// bits (`Options`), so a bad magic never masquerades as corruption.
pub fn stream_header_decode(buf: &[u8; STREAM_HEADER_SIZE]) -> Result<StreamFlags> {
    if buf[..6] != HEADER_MAGIC {
        return Err(Error::format("stream header magic bytes do not match"));
    }

    let stored = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let computed = Crc32::compute(&buf[6..8]);
    if stored != computed {
        return Err(Error::data("stream header CRC32 mismatch"));
    }

    StreamFlags::decode_flag_bytes([buf[6], buf[7]])
}

/// Encode a Stream Footer. The flags must carry a valid backward size.
pub fn stream_footer_encode(flags: StreamFlags) -> Result<[u8; STREAM_HEADER_SIZE]> {
    let backward_size = flags
        .backward_size
        .ok_or_else(|| Error::prog("stream footer needs a backward size"))?;
    if backward_size % 4 != 0
        || !(BACKWARD_SIZE_MIN..=BACKWARD_SIZE_MAX).contains(&backward_size)
    {
        return Err(Error::prog(format!("backward size {backward_size} is invalid")));
    }

    let mut out = [0u8; STREAM_HEADER_SIZE];
    let stored = ((backward_size / 4) - 1) as u32;
    out[4..8].copy_from_slice(&stored.to_le_bytes());
    out[8..10].copy_from_slice(&flags.encode_flag_bytes());
    let crc = Crc32::compute(&out[4..10]);
    out[..4].copy_from_slice(&crc.to_le_bytes());
    out[10..12].copy_from_slice(&FOOTER_MAGIC);
    Ok(out)
}

/// Decode a Stream Footer.
pub fn stream_footer_decode(buf: &[u8; STREAM_HEADER_SIZE]) -> Result<StreamFlags> {
    if buf[10..12] != FOOTER_MAGIC {
        return Err(Error::format("stream footer magic bytes do not match"));
    }

    let stored = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let computed = Crc32::compute(&buf[4..10]);
    if stored != computed {
        return Err(Error::data("stream footer CRC32 mismatch"));
    }

    let mut flags = StreamFlags::decode_flag_bytes([buf[8], buf[9]])?;
    let backward = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    flags.backward_size = Some((u64::from(backward) + 1) * 4);
    Ok(flags)
}

/// Compare the flags of a Stream Header and Stream Footer.
pub fn stream_flags_compare(header: StreamFlags, footer: StreamFlags) -> Result<()> {
    if header.check != footer.check {
        return Err(Error::data(
            "stream header and footer disagree about the check",
        ));
    }
    if let (Some(a), Some(b)) = (header.backward_size, footer.backward_size) {
        if a != b {
            return Err(Error::data(
                "stream header and footer disagree about the index size",
            ));
        }
    }
    Ok(())
}
