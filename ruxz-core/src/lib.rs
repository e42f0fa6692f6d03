//! # ruxz Core
//!
//! Core components for the ruxz .xz codec stack.
//!
//! This crate provides the fundamental building blocks shared by the codec
//! engines and the container layer:
//!
//! - [`vli`]: variable-length integers (7-bit groups, 63-bit range)
//! - [`crc`]: CRC-32 and CRC-64 checksums
//! - [`check`]: integrity-check kinds, sizes and accumulators
//! - [`traits`]: the streaming filter contract
//! - [`error`]: error types
//!
//! ## Architecture
//!
//! ruxz is a layered stack:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ L3: Container (ruxz-stream)                            │
//! │     Stream framing, Index, output queue, MT decoder    │
//! ├────────────────────────────────────────────────────────┤
//! │ L2: Codec engines (ruxz-lzma)                          │
//! │     LZMA2, delta, BCJ filter decoders                  │
//! ├────────────────────────────────────────────────────────┤
//! │ L1: Primitives (this crate)                            │
//! │     VLI, CRC, checks, filter trait, errors             │
//! └────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod check;
pub mod crc;
pub mod error;
pub mod traits;
pub mod vli;

// Re-exports for convenience
pub use check::{CheckKind, CheckState, CheckValue, CHECK_SIZE_MAX};
pub use crc::{Crc32, Crc64};
pub use error::{Error, Result};
pub use traits::{DecodeStatus, FilterDecode};
pub use vli::{vli_ceil4, vli_decode, vli_encode, vli_size, VliDecoder, VLI_BYTES_MAX, VLI_MAX};
