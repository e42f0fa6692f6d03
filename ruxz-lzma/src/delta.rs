//! Delta filter decoding.
//!
//! The delta filter stores each byte as the difference to the byte
//! `distance` positions earlier. Decoding adds the history byte back and is
//! purely streaming, so this stage transforms its downstream producer's
//! fresh output in place.

use ruxz_core::error::Result;
use ruxz_core::traits::{DecodeStatus, FilterDecode};

/// Number of history bytes kept; also the maximum distance.
const HISTORY_SIZE: usize = 256;

/// Streaming delta decoder wrapping the next stage of the chain.
pub struct DeltaDecoder {
    inner: Box<dyn FilterDecode>,
    distance: usize,
    pos: u8,
    history: [u8; HISTORY_SIZE],
}

impl DeltaDecoder {
    /// Wrap `inner` with a delta decode at `distance` (1..=256).
    pub fn new(inner: Box<dyn FilterDecode>, distance: u32) -> Self {
        Self {
            inner,
            distance: distance as usize,
            pos: 0,
            history: [0; HISTORY_SIZE],
        }
    }
}

impl FilterDecode for DeltaDecoder {
    fn decode(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        out: &mut [u8],
        out_pos: &mut usize,
        finish: bool,
    ) -> Result<DecodeStatus> {
        let start = *out_pos;
        let status = self.inner.decode(input, in_pos, out, out_pos, finish)?;

        for byte in &mut out[start..*out_pos] {
            *byte = byte.wrapping_add(self.history[(self.distance + usize::from(self.pos)) & 0xFF]);
            self.history[usize::from(self.pos)] = *byte;
            self.pos = self.pos.wrapping_sub(1);
        }

        Ok(status)
    }
}

/// Memory footprint of a delta stage.
pub fn delta_mem_usage() -> u64 {
    HISTORY_SIZE as u64 + 64
}
