//! The streaming contract implemented by every Block filter.

use crate::error::Result;

/// Outcome of one [`FilterDecode::decode`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The filter can make further progress when given more input or more
    /// output space.
    NeedMore,
    /// The filter reached its own end of stream and flushed all output.
    Finished,
}

/// A streaming decoder stage in a Block's filter chain.
///
/// A filter consumes bytes from `input[*in_pos..]`, produces bytes into
/// `out[*out_pos..]`, and advances both positions. A call may consume
/// nothing, produce nothing, or both; the caller decides when the overall
/// lack of progress is an error. `finish` promises that no input will
/// arrive beyond the end of `input`; filters use it to flush buffered
/// tail bytes.
///
/// Non-last filters own their upstream stage and pull from it, so a chain
/// is driven through a single `decode` call on its head. Chains move into
/// worker threads, hence `Send`.
pub trait FilterDecode: Send {
    /// Decode as much as the buffers allow.
    fn decode(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        out: &mut [u8],
        out_pos: &mut usize,
        finish: bool,
    ) -> Result<DecodeStatus>;
}
