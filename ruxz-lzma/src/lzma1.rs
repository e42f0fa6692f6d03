//! Raw LZMA1 stream decoding behind the filter contract.
//!
//! A Block that names the LZMA1 filter carries a single raw LZMA stream:
//! no chunk framing, properties taken from the filter flags, terminated by
//! the end-of-payload marker. Because the range coder has no framing of
//! its own, this stage must be told how many compressed bytes belong to it
//! (the Block Header's compressed size); it buffers exactly that many and
//! never touches the Block Padding or check that follow. The range
//! coder's trailing flush bytes are part of that count even though symbol
//! decoding never reads them back.

use crate::lzma::LzmaDecoder;
use crate::model::LzmaProps;
use crate::range::RangeDecoder;
use crate::window::DecodeWindow;
use ruxz_core::error::{Error, Result};
use ruxz_core::traits::{DecodeStatus, FilterDecode};

/// Streaming decoder for one raw LZMA1 payload.
pub struct Lzma1Decoder {
    window: DecodeWindow,
    lzma: LzmaDecoder,
    /// Declared size of the compressed payload.
    comp_size: usize,
    /// Collected payload bytes until the range coder can start.
    chunk: Vec<u8>,
    rc: Option<RangeDecoder>,
    finished: bool,
}

impl Lzma1Decoder {
    /// Create a decoder for a payload of exactly `compressed_size` bytes.
    pub fn new(props: LzmaProps, dict_size: u32, compressed_size: u64) -> Result<Self> {
        if props.lc > 8 || props.lp > 4 || props.pb > 4 || props.lc + props.lp > 4 {
            return Err(Error::options("invalid LZMA1 properties"));
        }
        let comp_size = usize::try_from(compressed_size).map_err(|_| Error::Mem)?;

        Ok(Self {
            window: DecodeWindow::new(dict_size),
            lzma: LzmaDecoder::new(props),
            comp_size,
            chunk: Vec::new(),
            rc: None,
            finished: false,
        })
    }
}

impl FilterDecode for Lzma1Decoder {
    fn decode(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        out: &mut [u8],
        out_pos: &mut usize,
        _finish: bool,
    ) -> Result<DecodeStatus> {
        if self.finished {
            return Ok(DecodeStatus::Finished);
        }

        if self.rc.is_none() {
            let want = self.comp_size - self.chunk.len();
            let n = want.min(input.len() - *in_pos);
            self.chunk.extend_from_slice(&input[*in_pos..*in_pos + n]);
            *in_pos += n;

            if self.chunk.len() < self.comp_size {
                return Ok(DecodeStatus::NeedMore);
            }
            self.rc = Some(RangeDecoder::new(std::mem::take(&mut self.chunk))?);
        }

        let rc = self
            .rc
            .as_mut()
            .ok_or_else(|| Error::prog("no active LZMA stream"))?;

        // No size limit: the marker is the only terminator.
        let mut remaining = u64::MAX;
        let marker = self
            .lzma
            .decode(rc, &mut self.window, out, out_pos, &mut remaining)?;

        if marker {
            // Whatever the coder left unread is its flush tail.
            self.rc = None;
            self.finished = true;
            return Ok(DecodeStatus::Finished);
        }

        Ok(DecodeStatus::NeedMore)
    }
}
