//! Single-Block decoder.
//!
//! Wraps the filter chain built from a Block Header, feeds the
//! integrity-check accumulator with every produced byte, and on
//! termination enforces the declared sizes, the zero Block Padding and
//! the trailing check value.

use crate::block::header::BlockOptions;
use crate::filter;
use crate::{Action, Status};
use ruxz_core::check::{CheckKind, CheckState, CHECK_SIZE_MAX};
use ruxz_core::error::{Error, Result};
use ruxz_core::traits::{DecodeStatus, FilterDecode};
use ruxz_core::vli::vli_ceil4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seq {
    Code,
    Padding,
    Check,
    Done,
}

/// Decoder for one Block's payload, padding and check.
pub struct BlockDecoder {
    chain: Box<dyn FilterDecode>,
    check_kind: CheckKind,
    check_state: Option<CheckState>,
    ignore_check: bool,
    compressed_size: Option<u64>,
    uncompressed_size: Option<u64>,
    compressed_seen: u64,
    uncompressed_seen: u64,
    seq: Seq,
    padding_left: u64,
    stored_check: [u8; CHECK_SIZE_MAX],
    check_pos: usize,
}

impl BlockDecoder {
    /// Build a decoder from fully populated Block options.
    pub fn new(options: &BlockOptions) -> Result<Self> {
        Ok(Self {
            chain: filter::build_chain(&options.filters, options.compressed_size)?,
            check_kind: options.check,
            check_state: Some(CheckState::new(options.check)),
            ignore_check: options.ignore_check,
            compressed_size: options.compressed_size,
            uncompressed_size: options.uncompressed_size,
            compressed_seen: 0,
            uncompressed_seen: 0,
            seq: Seq::Code,
            padding_left: 0,
            stored_check: [0; CHECK_SIZE_MAX],
            check_pos: 0,
        })
    }

    /// Decoder memory estimate for the chain of `options`.
    pub fn mem_usage(options: &BlockOptions) -> u64 {
        filter::chain_mem_usage(&options.filters)
    }

    /// Compressed bytes consumed so far (payload only, no padding/check).
    pub fn compressed_seen(&self) -> u64 {
        self.compressed_seen
    }

    /// Uncompressed bytes produced so far.
    pub fn uncompressed_seen(&self) -> u64 {
        self.uncompressed_seen
    }

    /// Drive the Block decode. Returns `Status::StreamEnd` once payload,
    /// padding and check have all been consumed and verified.
    pub fn code(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        out: &mut [u8],
        out_pos: &mut usize,
        action: Action,
    ) -> Result<Status> {
        if action == Action::SyncFlush {
            return Err(Error::options("sync flush is not supported by this filter chain"));
        }

        loop {
            match self.seq {
                Seq::Code => {
                    let in_before = *in_pos;
                    let out_before = *out_pos;

                    let status = self.chain.decode(
                        input,
                        in_pos,
                        out,
                        out_pos,
                        action == Action::Finish,
                    )?;

                    self.compressed_seen += (*in_pos - in_before) as u64;
                    self.uncompressed_seen += (*out_pos - out_before) as u64;
                    if let Some(check) = self.check_state.as_mut() {
                        check.update(&out[out_before..*out_pos]);
                    }

                    // Running totals may never exceed the declared sizes.
                    if self.compressed_size.is_some_and(|s| self.compressed_seen > s)
                        || self.uncompressed_size.is_some_and(|s| self.uncompressed_seen > s)
                    {
                        return Err(Error::data(
                            "block payload exceeds the sizes declared in its header",
                        ));
                    }

                    match status {
                        DecodeStatus::Finished => {
                            if let Some(size) = self.compressed_size {
                                if self.compressed_seen != size {
                                    return Err(Error::data(
                                        "compressed size does not match the block header",
                                    ));
                                }
                            }
                            if let Some(size) = self.uncompressed_size {
                                if self.uncompressed_seen != size {
                                    return Err(Error::data(
                                        "uncompressed size does not match the block header",
                                    ));
                                }
                            }
                            self.padding_left =
                                vli_ceil4(self.compressed_seen) - self.compressed_seen;
                            self.seq = Seq::Padding;
                        }
                        DecodeStatus::NeedMore => return Ok(Status::Ok),
                    }
                }

                Seq::Padding => {
                    while self.padding_left > 0 && *in_pos < input.len() {
                        if input[*in_pos] != 0x00 {
                            return Err(Error::data("non-zero block padding"));
                        }
                        *in_pos += 1;
                        self.padding_left -= 1;
                    }
                    if self.padding_left > 0 {
                        return Ok(Status::Ok);
                    }
                    self.seq = Seq::Check;
                }

                Seq::Check => {
                    let want = self.check_kind.size();
                    while self.check_pos < want && *in_pos < input.len() {
                        self.stored_check[self.check_pos] = input[*in_pos];
                        self.check_pos += 1;
                        *in_pos += 1;
                    }
                    if self.check_pos < want {
                        return Ok(Status::Ok);
                    }

                    if let Some(state) = self.check_state.take() {
                        let computed = state.finish();
                        if self.check_kind.is_supported()
                            && !self.ignore_check
                            && computed.as_slice() != &self.stored_check[..want]
                        {
                            return Err(Error::data("block integrity check mismatch"));
                        }
                    }

                    self.seq = Seq::Done;
                    return Ok(Status::StreamEnd);
                }

                Seq::Done => return Ok(Status::StreamEnd),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::header::block_header_size;
    use crate::filter::{Filter, FilterId, FilterOptions};
    use ruxz_lzma::lzma2_encode_uncompressed;

    fn block_options(payload: &[u8], data_len: u64, check: CheckKind) -> BlockOptions {
        let mut opts = BlockOptions {
            version: 1,
            check,
            header_size: 0,
            compressed_size: Some(payload.len() as u64),
            uncompressed_size: Some(data_len),
            ignore_check: false,
            filters: vec![Filter {
                id: FilterId::Lzma2,
                options: FilterOptions::Lzma2 { dict_size: 1 << 16 },
            }],
        };
        opts.header_size = block_header_size(&opts).unwrap();
        opts
    }

    /// Payload, padding and check for `data`, as they appear after a
    /// Block Header.
    fn block_body(data: &[u8], check: CheckKind) -> (Vec<u8>, BlockOptions) {
        let mut payload = Vec::new();
        lzma2_encode_uncompressed(data, &mut payload);

        let opts = block_options(&payload, data.len() as u64, check);

        let mut body = payload;
        let padding = (4 - body.len() % 4) % 4;
        body.extend(std::iter::repeat(0x00).take(padding));

        let mut state = CheckState::new(check);
        state.update(data);
        body.extend_from_slice(state.finish().as_slice());

        (body, opts)
    }

    fn decode(body: &[u8], opts: &BlockOptions, data_len: usize) -> Result<Vec<u8>> {
        let mut decoder = BlockDecoder::new(opts)?;
        let mut out = vec![0u8; data_len + 8];
        let mut in_pos = 0;
        let mut out_pos = 0;
        loop {
            let status = decoder.code(body, &mut in_pos, &mut out, &mut out_pos, Action::Finish)?;
            if status == Status::StreamEnd {
                out.truncate(out_pos);
                return Ok(out);
            }
            if in_pos == body.len() {
                return Err(Error::Buf);
            }
        }
    }

    #[test]
    fn test_block_roundtrip_with_checks() {
        for check in [CheckKind::None, CheckKind::Crc32, CheckKind::Crc64, CheckKind::Sha256] {
            let data = b"The quick brown fox jumps over the lazy dog";
            let (body, opts) = block_body(data, check);
            assert_eq!(decode(&body, &opts, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn test_empty_block() {
        let (body, opts) = block_body(b"", CheckKind::Crc32);
        assert_eq!(decode(&body, &opts, 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_corrupt_check_detected() {
        let data = b"check this";
        let (mut body, opts) = block_body(data, CheckKind::Crc32);
        let last = body.len() - 1;
        body[last] ^= 0x01;
        assert!(matches!(decode(&body, &opts, data.len()), Err(Error::Data(_))));
    }

    #[test]
    fn test_ignored_check_passes() {
        let data = b"check this";
        let (mut body, mut opts) = block_body(data, CheckKind::Crc32);
        let last = body.len() - 1;
        body[last] ^= 0x01;
        opts.ignore_check = true;
        assert_eq!(decode(&body, &opts, data.len()).unwrap(), data);
    }

    #[test]
    fn test_nonzero_padding_detected() {
        let data = b"pad";
        let (mut body, opts) = block_body(data, CheckKind::Crc32);
        // "pad" encodes to a 7-byte LZMA2 payload plus the end marker, so
        // padding bytes exist before the 4-byte check.
        let pad_index = body.len() - 5;
        body[pad_index] = 0xAA;
        assert!(matches!(decode(&body, &opts, data.len()), Err(Error::Data(_))));
    }

    #[test]
    fn test_wrong_declared_uncompressed_size() {
        let data = b"size mismatch body";
        let (body, mut opts) = block_body(data, CheckKind::Crc32);
        opts.uncompressed_size = Some(data.len() as u64 + 1);
        assert!(matches!(decode(&body, &opts, data.len() + 1), Err(Error::Data(_))));
    }

    #[test]
    fn test_wrong_declared_compressed_size() {
        let data = b"size mismatch body";
        let (body, mut opts) = block_body(data, CheckKind::Crc32);
        opts.compressed_size = Some(opts.compressed_size.unwrap() + 4);
        assert!(matches!(decode(&body, &opts, data.len()), Err(Error::Data(_))));
    }

    #[test]
    fn test_sync_flush_rejected() {
        let (body, opts) = block_body(b"x", CheckKind::Crc32);
        let mut decoder = BlockDecoder::new(&opts).unwrap();
        let mut out = [0u8; 8];
        let (mut in_pos, mut out_pos) = (0, 0);
        assert!(matches!(
            decoder.code(&body, &mut in_pos, &mut out, &mut out_pos, Action::SyncFlush),
            Err(Error::Options(_))
        ));
    }

    #[test]
    fn test_single_byte_buffers() {
        let data = b"one byte at a time";
        let (body, opts) = block_body(data, CheckKind::Crc64);

        let mut decoder = BlockDecoder::new(&opts).unwrap();
        let mut produced = Vec::new();
        let mut in_pos = 0;
        let mut status = Status::Ok;

        while status != Status::StreamEnd {
            let mut byte = [0u8; 1];
            let mut out_pos = 0;
            let end = (in_pos + 1).min(body.len());
            status = decoder
                .code(&body[..end], &mut in_pos, &mut byte, &mut out_pos, Action::Finish)
                .unwrap();
            produced.extend_from_slice(&byte[..out_pos]);
        }

        assert_eq!(produced, data);
    }
}
