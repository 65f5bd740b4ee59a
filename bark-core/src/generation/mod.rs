//! The three generative stages and the contracts they share.
//!
//! | Stage | Input | Output |
//! |---|---|---|
//! | [`SemanticStage`] | text | semantic ids at ~49.9 Hz |
//! | [`CoarseStage`] | semantic ids | 2 codebooks at 75 Hz |
//! | [`FineStage`] | coarse codebooks | full codec depth at 75 Hz |

pub mod coarse;
pub mod fine;
pub mod sampling;
pub mod semantic;
pub mod traits;

pub use coarse::{CoarseOptions, CoarseStage};
pub use fine::{FineOptions, FineStage};
pub use sampling::TokenSampler;
pub use semantic::{SemanticOptions, SemanticStage};
pub use traits::{AudioCodec, CausalLm, FineLm, TextEncoder};

pub const CONTEXT_WINDOW_SIZE: usize = 1024;

pub const SEMANTIC_RATE_HZ: f64 = 49.9;
pub const SEMANTIC_VOCAB_SIZE: usize = 10_000;

pub const CODEBOOK_SIZE: usize = 1024;
pub const N_COARSE_CODEBOOKS: usize = 2;
pub const N_FINE_CODEBOOKS: usize = 8;
pub const COARSE_RATE_HZ: f64 = 75.0;

/// Output sample rate of the codec; every waveform consumer uses it verbatim.
pub const SAMPLE_RATE: u32 = 24_000;

pub const TEXT_ENCODING_OFFSET: u32 = 10_048;
pub const SEMANTIC_PAD_TOKEN: u32 = 10_000;
pub const TEXT_PAD_TOKEN: u32 = 129_595;
pub const SEMANTIC_INFER_TOKEN: u32 = 129_599;

pub const COARSE_SEMANTIC_PAD_TOKEN: u32 = 12_048;
pub const COARSE_INFER_TOKEN: u32 = 12_050;

/// Number of text positions fed to the semantic model.
pub const MAX_TEXT_TOKENS: usize = 256;
/// Number of history positions fed to the semantic model.
pub const MAX_SEMANTIC_HISTORY: usize = 256;
