//! The Index and its O(1)-memory verifier.
//!
//! The Index lists the unpadded and uncompressed size of every Block so a
//! reader can seek without parsing Blocks. It is encoded as the 0x00
//! indicator, a VLI record count, the VLI record pairs, zero padding to a
//! four-byte boundary, and a CRC32 over all of the preceding bytes.
//!
//! During decoding the Stream decoder never materializes the Index.
//! [`IndexHash`] accumulates two running digests, one fed with the sizes
//! of the Blocks actually decoded and one fed while parsing the stored
//! Index,
//! and compares them at the end together with the stored CRC32.

use ruxz_core::crc::Crc32;
use ruxz_core::error::{Error, Result};
use ruxz_core::vli::{vli_ceil4, vli_decode, vli_encode, vli_size, VliDecoder, VLI_MAX};

use crate::Status;

/// The byte that introduces the Index where a Block Header would start.
pub const INDEX_INDICATOR: u8 = 0x00;

/// Sizes of one Block as recorded in the Index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    /// Block size without Block Padding: header + compressed data + check.
    pub unpadded_size: u64,
    /// Uncompressed size of the Block.
    pub uncompressed_size: u64,
}

/// In-memory Index: the ordered records of every Block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    records: Vec<IndexRecord>,
}

impl Index {
    /// An empty Index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// The records in Block order.
    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    /// Append one Block's sizes.
    pub fn append(&mut self, unpadded_size: u64, uncompressed_size: u64) -> Result<()> {
        validate_record(unpadded_size, uncompressed_size)?;
        self.records.push(IndexRecord {
            unpadded_size,
            uncompressed_size,
        });
        Ok(())
    }

    /// Encoded size of the Index field in bytes (a multiple of four).
    pub fn index_size(&self) -> u64 {
        let mut size = 1 + vli_size(self.records.len() as u64).unwrap_or(9) as u64;
        for record in &self.records {
            size += vli_size(record.unpadded_size).unwrap_or(9) as u64;
            size += vli_size(record.uncompressed_size).unwrap_or(9) as u64;
        }
        vli_ceil4(size) + 4
    }

    /// Sum of the padded Block sizes.
    pub fn total_blocks_size(&self) -> u64 {
        self.records
            .iter()
            .map(|r| vli_ceil4(r.unpadded_size))
            .sum()
    }

    /// Sum of the uncompressed sizes.
    pub fn total_uncompressed_size(&self) -> u64 {
        self.records.iter().map(|r| r.uncompressed_size).sum()
    }

    /// Append the encoded Index field.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        out.push(INDEX_INDICATOR);
        vli_encode(self.records.len() as u64, out)?;
        for record in &self.records {
            vli_encode(record.unpadded_size, out)?;
            vli_encode(record.uncompressed_size, out)?;
        }
        while (out.len() - start) % 4 != 0 {
            out.push(0x00);
        }
        let crc = Crc32::compute(&out[start..]);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Decode a complete encoded Index field.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 || buf.len() % 4 != 0 {
            return Err(Error::data("index field has an impossible size"));
        }
        if buf[0] != INDEX_INDICATOR {
            return Err(Error::data("missing index indicator byte"));
        }

        let crc_start = buf.len() - 4;
        let stored = u32::from_le_bytes([
            buf[crc_start],
            buf[crc_start + 1],
            buf[crc_start + 2],
            buf[crc_start + 3],
        ]);
        if stored != Crc32::compute(&buf[..crc_start]) {
            return Err(Error::data("index CRC32 mismatch"));
        }

        let body = &buf[..crc_start];
        let mut pos = 1;
        let count = vli_decode(body, &mut pos)?;

        let mut index = Self::new();
        for _ in 0..count {
            let unpadded = vli_decode(body, &mut pos)?;
            let uncompressed = vli_decode(body, &mut pos)?;
            index.append(unpadded, uncompressed)?;
        }

        if body[pos..].iter().any(|b| *b != 0x00) {
            return Err(Error::data("non-zero index padding"));
        }
        if (buf.len() as u64) != index.index_size() {
            return Err(Error::data("index field size disagrees with its records"));
        }

        Ok(index)
    }
}

fn validate_record(unpadded_size: u64, uncompressed_size: u64) -> Result<()> {
    if unpadded_size == 0 {
        return Err(Error::data("index record with zero unpadded size"));
    }
    if unpadded_size > VLI_MAX || uncompressed_size > VLI_MAX {
        return Err(Error::data("index record out of VLI range"));
    }
    Ok(())
}

/// Running digest over a sequence of records.
#[derive(Debug, Clone)]
struct RecordHash {
    count: u64,
    blocks_size: u64,
    uncompressed_size: u64,
    /// Bytes the records occupy when VLI-encoded.
    vli_bytes: u64,
    crc: Crc32,
}

impl RecordHash {
    fn new() -> Self {
        Self {
            count: 0,
            blocks_size: 0,
            uncompressed_size: 0,
            vli_bytes: 0,
            crc: Crc32::new(),
        }
    }

    fn append(&mut self, unpadded_size: u64, uncompressed_size: u64) -> Result<()> {
        validate_record(unpadded_size, uncompressed_size)?;

        self.count += 1;
        self.blocks_size = self
            .blocks_size
            .checked_add(vli_ceil4(unpadded_size))
            .ok_or_else(|| Error::data("total block size overflows"))?;
        self.uncompressed_size = self
            .uncompressed_size
            .checked_add(uncompressed_size)
            .ok_or_else(|| Error::data("total uncompressed size overflows"))?;

        // Hash the records through their canonical VLI encoding so the
        // digest is layout-independent.
        let mut encoded = Vec::with_capacity(18);
        vli_encode(unpadded_size, &mut encoded)?;
        vli_encode(uncompressed_size, &mut encoded)?;
        self.vli_bytes += encoded.len() as u64;
        self.crc.update(&encoded);
        Ok(())
    }

    fn matches(&self, other: &Self) -> bool {
        self.count == other.count
            && self.blocks_size == other.blocks_size
            && self.uncompressed_size == other.uncompressed_size
            && self.crc.finalize() == other.crc.finalize()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sq {
    Indicator,
    Count,
    Unpadded,
    Uncompressed,
    Padding,
    Crc,
    Done,
}

/// Memory-bounded verifier of the stored Index.
///
/// `append` is fed while Blocks are decoded; `decode` consumes the stored
/// Index (starting at its indicator byte) and verifies everything at the
/// end. `size` reports the encoded Index size for the Stream Footer
/// comparison.
#[derive(Debug)]
pub struct IndexHash {
    blocks: RecordHash,
    records: RecordHash,
    seq: Sq,
    vli: VliDecoder,
    /// Count of records the stored Index claims.
    remaining: u64,
    /// Unpadded size of the record being parsed.
    pending_unpadded: u64,
    /// CRC32 of the raw Index bytes.
    raw_crc: Crc32,
    /// Bytes of the Index consumed so far.
    consumed: u64,
    stored_crc: [u8; 4],
    stored_crc_pos: usize,
}

impl Default for IndexHash {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexHash {
    /// Fresh verifier for one Stream.
    pub fn new() -> Self {
        Self {
            blocks: RecordHash::new(),
            records: RecordHash::new(),
            seq: Sq::Indicator,
            vli: VliDecoder::new(),
            remaining: 0,
            pending_unpadded: 0,
            raw_crc: Crc32::new(),
            consumed: 0,
            stored_crc: [0; 4],
            stored_crc_pos: 0,
        }
    }

    /// Record the sizes of a Block that finished decoding.
    pub fn append(&mut self, unpadded_size: u64, uncompressed_size: u64) -> Result<()> {
        self.blocks.append(unpadded_size, uncompressed_size)
    }

    /// Encoded size of the Index: the actual bytes consumed once decoding
    /// completed, otherwise the size the appended Blocks imply.
    pub fn size(&self) -> u64 {
        if self.seq == Sq::Done {
            return self.consumed;
        }

        let unpadded = 1 + vli_size(self.blocks.count).unwrap_or(9) as u64 + self.blocks.vli_bytes;
        vli_ceil4(unpadded) + 4
    }

    /// Consume stored-Index bytes. Returns `Status::Ok` while incomplete
    /// and `Status::StreamEnd` once fully parsed and verified.
    pub fn decode(&mut self, input: &[u8], in_pos: &mut usize) -> Result<Status> {
        while *in_pos < input.len() {
            let byte = input[*in_pos];
            *in_pos += 1;
            self.consumed += 1;

            match self.seq {
                Sq::Indicator => {
                    if byte != INDEX_INDICATOR {
                        return Err(Error::data("missing index indicator byte"));
                    }
                    self.raw_crc.update(&[byte]);
                    self.seq = Sq::Count;
                }

                Sq::Count => {
                    self.raw_crc.update(&[byte]);
                    if let Some(count) = self.vli.feed(byte)? {
                        if count != self.blocks.count {
                            return Err(Error::data(
                                "index record count disagrees with the decoded blocks",
                            ));
                        }
                        self.remaining = count;
                        self.seq = if count == 0 { Sq::Padding } else { Sq::Unpadded };
                    }
                }

                Sq::Unpadded => {
                    self.raw_crc.update(&[byte]);
                    if let Some(value) = self.vli.feed(byte)? {
                        self.pending_unpadded = value;
                        self.seq = Sq::Uncompressed;
                    }
                }

                Sq::Uncompressed => {
                    self.raw_crc.update(&[byte]);
                    if let Some(value) = self.vli.feed(byte)? {
                        self.records.append(self.pending_unpadded, value)?;
                        self.remaining -= 1;
                        self.seq = if self.remaining == 0 {
                            Sq::Padding
                        } else {
                            Sq::Unpadded
                        };
                    }
                }

                Sq::Padding => {
                    // This byte's position is consumed - 1; padding runs
                    // until the position is four-byte aligned.
                    if (self.consumed - 1) % 4 != 0 {
                        if byte != 0x00 {
                            return Err(Error::data("non-zero index padding"));
                        }
                        self.raw_crc.update(&[byte]);
                    } else {
                        // This byte already belongs to the CRC field.
                        self.stored_crc[0] = byte;
                        self.stored_crc_pos = 1;
                        self.seq = Sq::Crc;
                    }
                }

                Sq::Crc => {
                    self.stored_crc[self.stored_crc_pos] = byte;
                    self.stored_crc_pos += 1;
                    if self.stored_crc_pos == 4 {
                        let stored = u32::from_le_bytes(self.stored_crc);
                        if stored != self.raw_crc.finalize() {
                            return Err(Error::data("index CRC32 mismatch"));
                        }
                        if !self.blocks.matches(&self.records) {
                            return Err(Error::data(
                                "index does not match the decoded blocks",
                            ));
                        }
                        self.seq = Sq::Done;
                        return Ok(Status::StreamEnd);
                    }
                }

                Sq::Done => return Err(Error::prog("index already fully decoded")),
            }
        }

        Ok(Status::Ok)
    }
}
