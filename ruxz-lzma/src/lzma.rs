//! Resumable LZMA symbol decoder.
//!
//! Decodes literals and matches from a chunk's range coder into the shared
//! history window, writing every produced byte to the caller's output slice
//! as well. Decoding pauses whenever the output slice fills, even in the
//! middle of a match copy, and resumes on the next call, so callers can
//! hand out space one byte at a time.

use crate::model::{
    LzmaModel, LzmaProps, LzmaState, ALIGN_BITS, DIST_MODEL_END, MATCH_LEN_MIN, POS_STATES_MAX,
};
use crate::range::RangeDecoder;
use crate::window::DecodeWindow;
use ruxz_core::error::{Error, Result};

/// The distance value that encodes the end-of-payload marker.
const END_MARKER_DIST: u32 = 0xFFFF_FFFF;

/// LZMA decoder state that persists across LZMA2 chunks.
#[derive(Debug)]
pub struct LzmaDecoder {
    model: LzmaModel,
    state: LzmaState,
    reps: [u32; 4],
    /// A match interrupted by a full output buffer: (distance, bytes left).
    pending_copy: Option<(u32, u32)>,
}

impl LzmaDecoder {
    /// Fresh decoder for `props`.
    pub fn new(props: LzmaProps) -> Self {
        Self {
            model: LzmaModel::new(props),
            state: LzmaState::new(),
            reps: [0; 4],
            pending_copy: None,
        }
    }

    /// State reset keeping the current properties.
    pub fn reset_state(&mut self) {
        self.model.reset();
        self.state = LzmaState::new();
        self.reps = [0; 4];
        self.pending_copy = None;
    }

    /// State reset with new properties.
    pub fn reset_with_props(&mut self, props: LzmaProps) {
        if props == self.model.props {
            self.reset_state();
        } else {
            self.model = LzmaModel::new(props);
            self.state = LzmaState::new();
            self.reps = [0; 4];
            self.pending_copy = None;
        }
    }

    /// Decode until `*limit` reaches zero or `out` fills up. `limit` counts
    /// the remaining uncompressed bytes and is decremented as bytes are
    /// produced.
    ///
    /// Returns `true` when the end-of-payload marker terminated decoding.
    /// Whether the marker is legal is the caller's business: a raw LZMA1
    /// stream ends with it, while LZMA2 chunks carry their sizes and must
    /// never contain one.
    pub fn decode(
        &mut self,
        rc: &mut RangeDecoder,
        window: &mut DecodeWindow,
        out: &mut [u8],
        out_pos: &mut usize,
        limit: &mut u64,
    ) -> Result<bool> {
        // Finish a match copy cut short by the previous call.
        if let Some((dist, mut left)) = self.pending_copy.take() {
            while left > 0 && *limit > 0 && *out_pos < out.len() {
                let byte = window.peek(dist);
                window.push(byte);
                out[*out_pos] = byte;
                *out_pos += 1;
                *limit -= 1;
                left -= 1;
            }
            if left > 0 {
                self.pending_copy = Some((dist, left));
                return Ok(false);
            }
        }

        while *limit > 0 && *out_pos < out.len() {
            let pos_state = (window.total() as u32 & self.model.props.pos_mask()) as usize;
            let state_idx = self.state.index();

            let is_match = rc
                .decode_bit(&mut self.model.is_match[state_idx * POS_STATES_MAX + pos_state])?;

            if is_match == 0 {
                let byte = self.decode_literal(rc, window)?;
                window.push(byte);
                out[*out_pos] = byte;
                *out_pos += 1;
                *limit -= 1;
                self.state.update_literal();
                continue;
            }

            let (len, dist) = if rc.decode_bit(&mut self.model.is_rep[state_idx])? == 0 {
                // New match: length, then distance.
                let len = self.decode_len(rc, false, pos_state)?;
                let dist = self.decode_distance(rc, len)?;

                self.reps = [dist, self.reps[0], self.reps[1], self.reps[2]];

                if dist == END_MARKER_DIST {
                    return Ok(true);
                }

                self.state.update_match();
                (len, dist)
            } else if rc.decode_bit(&mut self.model.is_rep0[state_idx])? == 0 {
                let long = rc.decode_bit(
                    &mut self.model.is_rep0_long[state_idx * POS_STATES_MAX + pos_state],
                )?;
                if long == 0 {
                    // Single byte at the most recent distance.
                    let dist = self.reps[0];
                    if !window.has_history(dist) {
                        return Err(Error::data("match distance exceeds history"));
                    }
                    let byte = window.peek(dist);
                    window.push(byte);
                    out[*out_pos] = byte;
                    *out_pos += 1;
                    *limit -= 1;
                    self.state.update_short_rep();
                    continue;
                }

                let len = self.decode_len(rc, true, pos_state)?;
                self.state.update_rep();
                (len, self.reps[0])
            } else {
                let dist = if rc.decode_bit(&mut self.model.is_rep1[state_idx])? == 0 {
                    self.reps.swap(0, 1);
                    self.reps[0]
                } else if rc.decode_bit(&mut self.model.is_rep2[state_idx])? == 0 {
                    let d = self.reps[2];
                    self.reps = [d, self.reps[0], self.reps[1], self.reps[3]];
                    d
                } else {
                    let d = self.reps[3];
                    self.reps = [d, self.reps[0], self.reps[1], self.reps[2]];
                    d
                };
                let len = self.decode_len(rc, true, pos_state)?;
                self.state.update_rep();
                (len, dist)
            };

            if u64::from(len) > *limit {
                return Err(Error::data("match overruns the chunk size"));
            }
            if !window.has_history(dist) {
                return Err(Error::data("match distance exceeds history"));
            }

            let mut left = len;
            while left > 0 && *limit > 0 && *out_pos < out.len() {
                let byte = window.peek(dist);
                window.push(byte);
                out[*out_pos] = byte;
                *out_pos += 1;
                *limit -= 1;
                left -= 1;
            }
            if left > 0 {
                self.pending_copy = Some((dist, left));
                return Ok(false);
            }
        }

        Ok(false)
    }

    fn decode_literal(&mut self, rc: &mut RangeDecoder, window: &DecodeWindow) -> Result<u8> {
        let prev_byte = if window.total() == 0 { 0 } else { window.peek(0) };
        let offset = self.model.literal_offset(window.total(), prev_byte);
        let probs = &mut self.model.literal[offset..offset + 0x300];

        let mut symbol = 1usize;
        if self.state.is_literal() {
            while symbol < 0x100 {
                let bit = rc.decode_bit(&mut probs[symbol])?;
                symbol = (symbol << 1) | bit as usize;
            }
        } else {
            // The previous symbol was a match: decode against the byte at
            // its distance until the prediction diverges.
            let mut match_byte = if window.has_history(self.reps[0]) {
                usize::from(window.peek(self.reps[0]))
            } else {
                return Err(Error::data("match distance exceeds history"));
            };

            while symbol < 0x100 {
                let match_bit = (match_byte >> 7) & 1;
                match_byte <<= 1;

                let bit =
                    rc.decode_bit(&mut probs[0x100 + (match_bit << 8) + symbol])? as usize;
                symbol = (symbol << 1) | bit;

                if bit != match_bit {
                    while symbol < 0x100 {
                        let bit = rc.decode_bit(&mut probs[symbol])?;
                        symbol = (symbol << 1) | bit as usize;
                    }
                    break;
                }
            }
        }

        Ok((symbol - 0x100) as u8)
    }

    fn decode_len(&mut self, rc: &mut RangeDecoder, rep: bool, pos_state: usize) -> Result<u32> {
        let coder = if rep {
            &mut self.model.rep_len
        } else {
            &mut self.model.match_len
        };

        if rc.decode_bit(&mut coder.choice)? == 0 {
            let base = pos_state * 8;
            let sym = rc.decode_bit_tree(&mut coder.low[base..base + 8], 3)?;
            Ok(MATCH_LEN_MIN + sym)
        } else if rc.decode_bit(&mut coder.choice2)? == 0 {
            let base = pos_state * 8;
            let sym = rc.decode_bit_tree(&mut coder.mid[base..base + 8], 3)?;
            Ok(MATCH_LEN_MIN + 8 + sym)
        } else {
            let sym = rc.decode_bit_tree(&mut coder.high, 8)?;
            Ok(MATCH_LEN_MIN + 16 + sym)
        }
    }

    fn decode_distance(&mut self, rc: &mut RangeDecoder, len: u32) -> Result<u32> {
        let len_state = (len - MATCH_LEN_MIN).min(3) as usize;
        let base = len_state * 64;
        let slot = rc.decode_bit_tree(&mut self.model.dist_slot[base..base + 64], 6)?;

        if slot < 4 {
            return Ok(slot);
        }

        let direct_bits = (slot >> 1) - 1;
        let mut dist = (2 | (slot & 1)) << direct_bits;

        if slot < DIST_MODEL_END {
            let offset = (dist - slot) as usize;
            let len = (1usize << direct_bits) - 1;
            let probs = &mut self.model.dist_special[offset..offset + len];
            dist += decode_reverse_tree_flat(rc, probs, direct_bits)?;
        } else {
            dist += rc.decode_direct_bits(direct_bits - ALIGN_BITS)? << ALIGN_BITS;
            dist += rc.decode_bit_tree_reverse(&mut self.model.dist_align, ALIGN_BITS)?;
        }

        Ok(dist)
    }
}

/// Reverse bit tree over a zero-based probability slice (the special
/// distance trees are packed without the implicit root element).
fn decode_reverse_tree_flat(
    rc: &mut RangeDecoder,
    probs: &mut [u16],
    num_bits: u32,
) -> Result<u32> {
    let mut result = 0u32;
    let mut index = 1usize;
    for i in 0..num_bits {
        let bit = rc.decode_bit(&mut probs[index - 1])?;
        index = (index << 1) | bit as usize;
        result |= bit << i;
    }
    Ok(result)
}

/// Decoder memory footprint for the given dictionary and properties upper
/// bound, used by admission control before the real properties are known.
pub fn decoder_mem_usage(dict_size: u32) -> u64 {
    // Window plus the largest possible probability model (lc + lp == 4)
    // plus fixed structure overhead.
    u64::from(dict_size.max(crate::window::DICT_SIZE_MIN))
        + (0x300u64 << 4) * 2
        + (1 << 14)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_usage_monotonic() {
        assert!(decoder_mem_usage(1 << 20) < decoder_mem_usage(1 << 24));
        // The floor comes from the minimum dictionary size.
        assert_eq!(decoder_mem_usage(0), decoder_mem_usage(4096));
    }

    #[test]
    fn test_reset_clears_pending_copy() {
        let mut dec = LzmaDecoder::new(LzmaProps::default());
        dec.pending_copy = Some((1, 10));
        dec.reset_state();
        assert!(dec.pending_copy.is_none());
    }
}
