//! # ruxz LZMA
//!
//! Filter decode engines for the .xz container: an incremental LZMA2
//! decoder plus the delta and BCJ transforms that may precede it in a
//! Block's filter chain.
//!
//! Everything here implements [`ruxz_core::traits::FilterDecode`], the
//! streaming contract the container layer drives: arbitrary input slices
//! in, arbitrary output slices out, resumable at any byte boundary.
//!
//! - [`lzma2`]: LZMA2 chunk layer over the LZMA symbol decoder
//! - [`lzma1`]: raw LZMA1 streams terminated by the end-of-payload marker
//! - [`lzma`], [`model`], [`range`], [`window`]: the symbol decoder itself
//! - [`delta`]: delta filter
//! - [`bcj`]: branch converters (x86, PowerPC, IA-64, ARM, ARM-Thumb,
//!   SPARC, ARM64)
//! - [`enc`]: uncompressed-chunk LZMA2 framing for producing valid streams
//!   without a compressor

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod bcj;
pub mod delta;
pub mod enc;
pub mod lzma;
pub mod lzma1;
pub mod lzma2;
pub mod model;
pub mod range;
pub mod window;

// Re-exports for convenience
pub use bcj::{bcj_mem_usage, BcjDecoder, BcjKind};
pub use delta::{delta_mem_usage, DeltaDecoder};
pub use enc::{lzma2_bound_uncompressed, lzma2_encode_uncompressed};
pub use lzma::decoder_mem_usage as lzma2_decoder_mem_usage;
pub use lzma1::Lzma1Decoder;
pub use lzma2::Lzma2Decoder;
pub use model::LzmaProps;
pub use window::DICT_SIZE_MIN;
