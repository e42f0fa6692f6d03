//! Incremental LZMA2 decoder.
//!
//! LZMA2 frames LZMA data into chunks. Each chunk starts with a control
//! byte:
//!
//! - `0x00`: end of the LZMA2 stream
//! - `0x01`: uncompressed chunk, dictionary reset first
//! - `0x02`: uncompressed chunk, no reset
//! - `0x80..=0xFF`: LZMA chunk; bits 0 to 4 are the high bits of the
//!   uncompressed size and `(control >> 5) & 3` is the reset level:
//!   0 = nothing, 1 = state, 2 = state + new properties byte,
//!   3 = state + properties + dictionary
//!
//! Size fields are 16-bit big-endian, stored minus one. The first chunk of
//! a stream must reset the dictionary, and the first LZMA chunk after an
//! uncompressed chunk must reset the decoder state.
//!
//! This decoder consumes arbitrary input slices and produces into arbitrary
//! output slices: header bytes are parsed as they trickle in, a chunk's
//! compressed bytes are buffered until complete, and the symbol decoder
//! pauses whenever the output fills.

use crate::lzma::LzmaDecoder;
use crate::model::LzmaProps;
use crate::range::RangeDecoder;
use crate::window::DecodeWindow;
use ruxz_core::error::{Error, Result};
use ruxz_core::traits::{DecodeStatus, FilterDecode};

/// Maximum compressed size of one LZMA chunk.
pub const CHUNK_COMPRESSED_MAX: usize = 1 << 16;

/// Maximum uncompressed size of one LZMA chunk.
pub const CHUNK_UNCOMPRESSED_MAX: u32 = 1 << 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seq {
    Control,
    UncompSizeHigh,
    UncompSizeLow,
    CompSizeHigh,
    CompSizeLow,
    Props,
    UncompData,
    LzmaCollect,
    LzmaRun,
    End,
}

/// Streaming LZMA2 decoder, the mandatory last stage of a filter chain.
#[derive(Debug)]
pub struct Lzma2Decoder {
    window: DecodeWindow,
    lzma: Option<LzmaDecoder>,
    props: Option<LzmaProps>,
    seq: Seq,
    control: u8,
    /// Uncompressed bytes left in the current chunk.
    uncomp_remaining: u64,
    /// Declared compressed size of the current LZMA chunk.
    comp_size: usize,
    /// Collected compressed bytes of the current LZMA chunk.
    chunk: Vec<u8>,
    rc: Option<RangeDecoder>,
    /// The first chunk must reset the dictionary.
    need_dict_reset: bool,
    /// The next LZMA chunk must reset the state (start of stream or after
    /// an uncompressed chunk).
    need_state_reset: bool,
}

impl Lzma2Decoder {
    /// Create a decoder with the dictionary size from the filter
    /// properties.
    pub fn new(dict_size: u32) -> Self {
        Self {
            window: DecodeWindow::new(dict_size),
            lzma: None,
            props: None,
            seq: Seq::Control,
            control: 0,
            uncomp_remaining: 0,
            comp_size: 0,
            chunk: Vec::new(),
            rc: None,
            need_dict_reset: true,
            need_state_reset: true,
        }
    }

    fn start_chunk(&mut self, control: u8) -> Result<()> {
        self.control = control;

        if control == 0x01 || control == 0x02 {
            if self.need_dict_reset && control != 0x01 {
                return Err(Error::data("LZMA2 stream does not begin with a dictionary reset"));
            }
            if control == 0x01 {
                self.window.reset();
            }
            self.seq = Seq::UncompSizeHigh;
            return Ok(());
        }

        if control < 0x80 {
            return Err(Error::data(format!("invalid LZMA2 control byte 0x{control:02X}")));
        }

        let reset = (control >> 5) & 0x03;
        if self.need_dict_reset && reset != 3 {
            return Err(Error::data("LZMA2 stream does not begin with a dictionary reset"));
        }
        if self.need_state_reset && reset == 0 {
            return Err(Error::data("LZMA chunk continues a state that was never set"));
        }

        self.uncomp_remaining = u64::from(control & 0x1F) << 16;
        self.seq = Seq::UncompSizeHigh;
        Ok(())
    }

    /// Apply the reset level once the whole chunk header has been read.
    fn apply_resets(&mut self) -> Result<()> {
        let reset = (self.control >> 5) & 0x03;

        if reset == 3 {
            self.window.reset();
        }

        if reset >= 2 {
            // A new properties byte was parsed into self.props.
            let props = self.props.ok_or_else(|| Error::data("missing LZMA properties"))?;
            match self.lzma.as_mut() {
                Some(lzma) => lzma.reset_with_props(props),
                None => self.lzma = Some(LzmaDecoder::new(props)),
            }
        } else if reset == 1 {
            match self.lzma.as_mut() {
                Some(lzma) => lzma.reset_state(),
                None => return Err(Error::data("LZMA chunk without properties")),
            }
        } else if self.lzma.is_none() {
            return Err(Error::data("LZMA chunk without properties"));
        }

        self.need_dict_reset = false;
        self.need_state_reset = false;
        Ok(())
    }
}

impl FilterDecode for Lzma2Decoder {
    fn decode(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        out: &mut [u8],
        out_pos: &mut usize,
        _finish: bool,
    ) -> Result<DecodeStatus> {
        loop {
            match self.seq {
                Seq::Control => {
                    if *in_pos >= input.len() {
                        return Ok(DecodeStatus::NeedMore);
                    }
                    let control = input[*in_pos];
                    *in_pos += 1;

                    if control == 0x00 {
                        self.seq = Seq::End;
                        continue;
                    }
                    self.start_chunk(control)?;
                }

                Seq::UncompSizeHigh => {
                    if *in_pos >= input.len() {
                        return Ok(DecodeStatus::NeedMore);
                    }
                    self.uncomp_remaining |= u64::from(input[*in_pos]) << 8;
                    *in_pos += 1;
                    self.seq = Seq::UncompSizeLow;
                }

                Seq::UncompSizeLow => {
                    if *in_pos >= input.len() {
                        return Ok(DecodeStatus::NeedMore);
                    }
                    self.uncomp_remaining |= u64::from(input[*in_pos]);
                    self.uncomp_remaining += 1;
                    *in_pos += 1;

                    if self.control < 0x80 {
                        // Uncompressed chunks reset the probability state of
                        // whatever LZMA chunk follows.
                        self.need_state_reset = true;
                        self.need_dict_reset = false;
                        self.seq = Seq::UncompData;
                    } else {
                        self.seq = Seq::CompSizeHigh;
                    }
                }

                Seq::CompSizeHigh => {
                    if *in_pos >= input.len() {
                        return Ok(DecodeStatus::NeedMore);
                    }
                    self.comp_size = usize::from(input[*in_pos]) << 8;
                    *in_pos += 1;
                    self.seq = Seq::CompSizeLow;
                }

                Seq::CompSizeLow => {
                    if *in_pos >= input.len() {
                        return Ok(DecodeStatus::NeedMore);
                    }
                    self.comp_size |= usize::from(input[*in_pos]);
                    self.comp_size += 1;
                    *in_pos += 1;

                    if (self.control >> 5) & 0x03 >= 2 {
                        self.seq = Seq::Props;
                    } else {
                        self.apply_resets()?;
                        self.chunk.clear();
                        self.seq = Seq::LzmaCollect;
                    }
                }

                Seq::Props => {
                    if *in_pos >= input.len() {
                        return Ok(DecodeStatus::NeedMore);
                    }
                    self.props = Some(LzmaProps::from_byte(input[*in_pos])?);
                    *in_pos += 1;

                    self.apply_resets()?;
                    self.chunk.clear();
                    self.seq = Seq::LzmaCollect;
                }

                Seq::UncompData => {
                    let avail_in = input.len() - *in_pos;
                    let avail_out = out.len() - *out_pos;
                    let n = (self.uncomp_remaining.min(avail_in as u64) as usize).min(avail_out);

                    for i in 0..n {
                        let byte = input[*in_pos + i];
                        self.window.push(byte);
                        out[*out_pos + i] = byte;
                    }
                    *in_pos += n;
                    *out_pos += n;
                    self.uncomp_remaining -= n as u64;

                    if self.uncomp_remaining == 0 {
                        self.seq = Seq::Control;
                    } else {
                        return Ok(DecodeStatus::NeedMore);
                    }
                }

                Seq::LzmaCollect => {
                    let want = self.comp_size - self.chunk.len();
                    let avail = input.len() - *in_pos;
                    let n = want.min(avail);
                    self.chunk.extend_from_slice(&input[*in_pos..*in_pos + n]);
                    *in_pos += n;

                    if self.chunk.len() < self.comp_size {
                        return Ok(DecodeStatus::NeedMore);
                    }

                    self.rc = Some(RangeDecoder::new(std::mem::take(&mut self.chunk))?);
                    self.seq = Seq::LzmaRun;
                }

                Seq::LzmaRun => {
                    let rc = self.rc.as_mut().ok_or_else(|| Error::prog("no active chunk"))?;
                    let lzma = self
                        .lzma
                        .as_mut()
                        .ok_or_else(|| Error::prog("no active LZMA state"))?;

                    let marker =
                        lzma.decode(rc, &mut self.window, out, out_pos, &mut self.uncomp_remaining)?;
                    if marker {
                        // LZMA2 chunks carry their sizes; the in-band
                        // marker must not appear.
                        return Err(Error::data("unexpected end marker in LZMA chunk"));
                    }

                    if self.uncomp_remaining > 0 {
                        // The output buffer filled; resume on the next call.
                        return Ok(DecodeStatus::NeedMore);
                    }

                    let rc = self.rc.take().ok_or_else(|| Error::prog("no active chunk"))?;
                    if !rc.is_finished() {
                        return Err(Error::data("LZMA chunk has trailing compressed bytes"));
                    }
                    self.seq = Seq::Control;
                }

                Seq::End => return Ok(DecodeStatus::Finished),
            }
        }
    }
}
