//! Integrity-check kinds and their streaming accumulators.
//!
//! The Stream Flags name one of sixteen check ids. Four of them are real
//! algorithms in this build (none, CRC-32, CRC-64, SHA-256); the rest are
//! reserved by the format but still have defined check sizes, so a decoder
//! that was asked to ignore verification can skip over their bytes.

use sha2::{Digest, Sha256};

use crate::crc::{Crc32, Crc64};
use crate::error::{Error, Result};

/// Check sizes in bytes for every wire id 0..=15.
const CHECK_SIZES: [usize; 16] = [0, 4, 4, 4, 8, 8, 8, 16, 16, 16, 32, 32, 32, 64, 64, 64];

/// Largest check size of any id.
pub const CHECK_SIZE_MAX: usize = 64;

/// The integrity-check kind named by a Stream's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    /// No check (id 0x00).
    None,
    /// CRC-32 (id 0x01).
    Crc32,
    /// CRC-64/ECMA-182 (id 0x04).
    Crc64,
    /// SHA-256 (id 0x0A).
    Sha256,
    /// A reserved id this build cannot verify. The payload is the wire id.
    Reserved(u8),
}

impl CheckKind {
    /// Decode a wire id. Ids above 15 do not fit the 4-bit field.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::Crc32),
            0x04 => Ok(Self::Crc64),
            0x0A => Ok(Self::Sha256),
            0x02..=0x0F => Ok(Self::Reserved(id)),
            _ => Err(Error::prog(format!("check id {id} is out of range"))),
        }
    }

    /// The wire id of this kind.
    pub fn to_id(self) -> u8 {
        match self {
            Self::None => 0x00,
            Self::Crc32 => 0x01,
            Self::Crc64 => 0x04,
            Self::Sha256 => 0x0A,
            Self::Reserved(id) => id,
        }
    }

    /// Size in bytes of the check field that follows each Block.
    pub fn size(self) -> usize {
        CHECK_SIZES[self.to_id() as usize]
    }

    /// Whether this build can compute the check.
    pub fn is_supported(self) -> bool {
        !matches!(self, Self::Reserved(_))
    }
}

/// Streaming accumulator for one Block's check value.
#[derive(Debug, Clone)]
pub enum CheckState {
    /// No check requested, or an unsupported kind being skipped.
    None,
    /// CRC-32 accumulator.
    Crc32(Crc32),
    /// CRC-64 accumulator.
    Crc64(Crc64),
    /// SHA-256 accumulator.
    Sha256(Box<Sha256>),
}

impl CheckState {
    /// Create an accumulator for `kind`. Unsupported kinds accumulate
    /// nothing; their check bytes can only be skipped, not verified.
    pub fn new(kind: CheckKind) -> Self {
        match kind {
            CheckKind::Crc32 => Self::Crc32(Crc32::new()),
            CheckKind::Crc64 => Self::Crc64(Crc64::new()),
            CheckKind::Sha256 => Self::Sha256(Box::new(Sha256::new())),
            CheckKind::None | CheckKind::Reserved(_) => Self::None,
        }
    }

    /// Feed uncompressed Block bytes.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::None => {}
            Self::Crc32(crc) => crc.update(data),
            Self::Crc64(crc) => crc.update(data),
            Self::Sha256(sha) => sha.update(data),
        }
    }

    /// Finish and return the wire bytes of the check value. CRC values are
    /// little-endian; SHA-256 is the raw digest.
    pub fn finish(self) -> CheckValue {
        let mut value = CheckValue::empty();
        match self {
            Self::None => {}
            Self::Crc32(crc) => value.push(&crc.finalize().to_le_bytes()),
            Self::Crc64(crc) => value.push(&crc.finalize().to_le_bytes()),
            Self::Sha256(sha) => value.push(&sha.finalize()),
        }
        value
    }
}

/// A computed check value, at most [`CHECK_SIZE_MAX`] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckValue {
    bytes: [u8; CHECK_SIZE_MAX],
    len: usize,
}

impl CheckValue {
    fn empty() -> Self {
        Self {
            bytes: [0; CHECK_SIZE_MAX],
            len: 0,
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.bytes[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
    }

    /// The wire bytes of the value.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}
