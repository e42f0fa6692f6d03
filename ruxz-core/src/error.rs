//! Error types for ruxz operations.
//!
//! One error enum covers the whole stack. The variants follow the failure
//! taxonomy of the .xz format: `Format` means "this is not an .xz stream at
//! all", `Data` means "an .xz stream, but these bytes violate the format or
//! an integrity check", `Options` means "syntactically valid but requests
//! something this build does not support", and the rest cover resources,
//! liveness and API misuse.

use thiserror::Error;

/// The main error type for ruxz operations.
///
/// `Clone` because the multithreaded decoder records a worker's error both
/// on the output slot it was producing and as the first-error of the whole
/// run.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The input is not recognizable as an .xz stream (bad magic bytes on
    /// the first Stream).
    #[error("file format not recognized: {0}")]
    Format(String),

    /// The input is an .xz stream but the bytes are corrupt: CRC mismatch,
    /// declared sizes that do not match reality, malformed integers,
    /// index mismatch.
    #[error("corrupt input data: {0}")]
    Data(String),

    /// The headers are well-formed but refer to features that are invalid
    /// or unsupported: unknown filter ID, reserved bits set, non-zero
    /// header padding, unsupported version.
    #[error("invalid or unsupported options: {0}")]
    Options(String),

    /// An allocation or thread could not be created.
    #[error("cannot allocate memory or spawn a worker thread")]
    Mem,

    /// Decoding would exceed the configured hard memory limit. Recoverable
    /// by raising the limit and calling again.
    #[error("memory usage limit reached: need {needed} bytes, limit is {limit}")]
    Memlimit {
        /// Bytes that would be needed to continue.
        needed: u64,
        /// The configured hard limit.
        limit: u64,
    },

    /// No progress is possible: no input can be consumed and no output can
    /// be produced.
    #[error("no progress is possible")]
    Buf,

    /// API misuse: out-of-range argument, a call in a state that cannot
    /// accept it.
    #[error("programming error: {0}")]
    Prog(String),
}

/// Result alias using the crate-level [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }

    /// Create a data-corruption error.
    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }

    /// Create an options error.
    pub fn options(message: impl Into<String>) -> Self {
        Self::Options(message.into())
    }

    /// Create a programming-error value.
    pub fn prog(message: impl Into<String>) -> Self {
        Self::Prog(message.into())
    }

    /// Create a memory-limit error.
    pub fn memlimit(needed: u64, limit: u64) -> Self {
        Self::Memlimit { needed, limit }
    }

    /// True for errors the caller can recover from by changing limits or
    /// calling again; everything else terminates the Stream.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Memlimit { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::format("bad magic");
        assert!(err.to_string().contains("not recognized"));

        let err = Error::memlimit(2048, 1024);
        assert!(err.to_string().contains("2048"));
        assert!(err.to_string().contains("1024"));

        let err = Error::data("CRC mismatch");
        assert!(err.to_string().contains("CRC mismatch"));
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::memlimit(2, 1).is_recoverable());
        assert!(!Error::Buf.is_recoverable());
        assert!(!Error::data("x").is_recoverable());
    }
}
