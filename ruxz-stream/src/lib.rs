//! # ruxz Stream
//!
//! The .xz container layer: framing codecs, the Index and its verifier,
//! and a multithreaded Stream decoder that dispatches Block decoding to a
//! worker pool while the caller keeps reading plain ordered bytes.
//!
//! ## Decoding
//!
//! ```no_run
//! use ruxz_stream::{Action, MtDecoderOptions, MtStreamDecoder, Status};
//!
//! # fn main() -> ruxz_core::error::Result<()> {
//! let compressed: Vec<u8> = std::fs::read("data.xz").unwrap();
//! let mut decoder = MtStreamDecoder::new(
//!     MtDecoderOptions::default().threads(4).memlimit_stop(1 << 30),
//! )?;
//!
//! let mut out = vec![0u8; 1 << 16];
//! let mut in_pos = 0;
//! loop {
//!     let mut out_pos = 0;
//!     let status = decoder.code(
//!         &compressed, &mut in_pos, &mut out, &mut out_pos, Action::Finish,
//!     )?;
//!     // use out[..out_pos]
//!     if status == Status::StreamEnd {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`mt`]: the multithreaded Stream decoder
//! - [`header`], [`block`], [`index`]: the framing codecs
//! - [`filter`], [`filter_str`]: the filter registry and its string form
//! - [`outq`]: the ordered output queue
//! - [`encode`]: single-shot Stream production (uncompressed framing)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod block;
pub mod encode;
pub mod filter;
pub mod filter_str;
pub mod header;
pub mod index;
pub mod mt;
pub mod outq;

use ruxz_core::error::{Error, Result};

// Re-exports for convenience
pub use encode::{stream_buffer_encode, stream_buffer_encode_opts, StreamEncodeOptions};
pub use filter::{Filter, FilterId, FilterOptions};
pub use filter_str::{filters_from_str, filters_to_str};
pub use header::StreamFlags;
pub use index::{Index, IndexHash, IndexRecord};
pub use mt::MtStreamDecoder;

/// Largest accepted worker-thread count.
pub const THREADS_MAX: u32 = 16384;

/// How a `code` call is allowed to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Decode as much as the buffers allow; more input may follow.
    Run,
    /// Flush everything decodable so far. Unsupported by the coders in
    /// this crate; rejected rather than silently ignored.
    SyncFlush,
    /// No input beyond the current buffer will ever arrive.
    Finish,
}

/// Successful outcomes of a `code` call. Failures are [`Error`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Progress was (possibly) made; call again with more input or more
    /// output space.
    Ok,
    /// The Stream (or the current unit) is complete.
    StreamEnd,
    /// The Stream has no integrity check. Informational; only reported
    /// when asked for, decoding continues on the next call.
    NoCheck,
    /// The Stream's integrity check is not supported by this build.
    /// Informational, like [`Status::NoCheck`].
    UnsupportedCheck,
    /// The check kind is now known; `get_check` can be called.
    GetCheck,
    /// A blocking wait exceeded the configured timeout. Not an error;
    /// call again to continue.
    TimedOut,
}

/// Configuration for [`MtStreamDecoder::new`].
#[derive(Debug, Clone, Copy)]
pub struct MtDecoderOptions {
    /// Maximum number of worker threads, 1..=[`THREADS_MAX`].
    pub threads_max: u32,
    /// Maximum milliseconds one `code` call may block; 0 waits without
    /// bound.
    pub timeout_ms: u64,
    /// Soft limit: decoding stays below this by throttling or falling
    /// back to direct mode.
    pub memlimit_threading: u64,
    /// Hard limit: exceeding it fails with a memory-limit error.
    pub memlimit_stop: u64,
    /// Report [`Status::NoCheck`] for checkless Streams.
    pub tell_no_check: bool,
    /// Report [`Status::UnsupportedCheck`] for unverifiable checks.
    pub tell_unsupported_check: bool,
    /// Report [`Status::GetCheck`] once the check kind is known.
    pub tell_any_check: bool,
    /// Skip verification of Block integrity checks.
    pub ignore_check: bool,
    /// Decode concatenated Streams separated by Stream Padding.
    pub concatenated: bool,
}

impl Default for MtDecoderOptions {
    fn default() -> Self {
        Self {
            threads_max: 1,
            timeout_ms: 0,
            memlimit_threading: u64::MAX,
            memlimit_stop: u64::MAX,
            tell_no_check: false,
            tell_unsupported_check: false,
            tell_any_check: false,
            ignore_check: false,
            concatenated: false,
        }
    }
}

impl MtDecoderOptions {
    /// Set the worker-thread cap.
    #[must_use]
    pub fn threads(mut self, threads_max: u32) -> Self {
        self.threads_max = threads_max;
        self
    }

    /// Set the blocking timeout in milliseconds (0 = unbounded).
    #[must_use]
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the threading (soft) memory limit.
    #[must_use]
    pub fn memlimit_threading(mut self, limit: u64) -> Self {
        self.memlimit_threading = limit;
        self
    }

    /// Set the hard memory limit.
    #[must_use]
    pub fn memlimit_stop(mut self, limit: u64) -> Self {
        self.memlimit_stop = limit;
        self
    }

    /// Report Streams that carry no integrity check.
    #[must_use]
    pub fn tell_no_check(mut self, tell: bool) -> Self {
        self.tell_no_check = tell;
        self
    }

    /// Report Streams whose check this build cannot verify.
    #[must_use]
    pub fn tell_unsupported_check(mut self, tell: bool) -> Self {
        self.tell_unsupported_check = tell;
        self
    }

    /// Report the check kind as soon as it is known.
    #[must_use]
    pub fn tell_any_check(mut self, tell: bool) -> Self {
        self.tell_any_check = tell;
        self
    }

    /// Skip Block check verification.
    #[must_use]
    pub fn ignore_check(mut self, ignore: bool) -> Self {
        self.ignore_check = ignore;
        self
    }

    /// Accept concatenated Streams.
    #[must_use]
    pub fn concatenated(mut self, concatenated: bool) -> Self {
        self.concatenated = concatenated;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.threads_max == 0 || self.threads_max > THREADS_MAX {
            return Err(Error::options(format!(
                "thread count must be within 1..={THREADS_MAX}"
            )));
        }
        Ok(())
    }
}
