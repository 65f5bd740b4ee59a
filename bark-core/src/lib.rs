//! Staged text-to-audio generation.
//!
//! Text becomes speech through three generative stages followed by a codec
//! decode:
//!
//! ```text
//! text ──► SemanticStage ──► CoarseStage ──► FineStage ──► CodecAdapter ──► waveform
//! ```
//!
//! Every stage takes an optional [`HistoryPrompt`] that conditions it on a
//! voice. A full generation ([`VoiceBundle`]) can be saved as `.npz` and fed
//! back as the prompt of later calls. [`cloning`] derives bundles from real
//! recordings.
//!
//! The models sit behind the traits in [`generation::traits`]; [`models`]
//! provides candle implementations and [`models::load_pipeline`] wires them up.

pub mod audio;
pub mod bundle;
pub mod cloning;
pub mod codec;
pub mod error;
pub mod generation;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod utils;
pub mod voices;

#[cfg(test)]
pub(crate) mod test_utils;

pub use audio::{read_wav, write_wav, Waveform};
pub use bundle::{
    load_bundle, load_history_prompt, save_bundle, CodebookTokens, HistoryPrompt, PartialBundle,
    SemanticTokens, VoiceBundle,
};
pub use cloning::{ContentTokenizer, SwapCandidate, VoiceCloner, VoiceSwapper};
pub use codec::CodecAdapter;
pub use error::{BarkError, Result};
pub use models::load_pipeline;
pub use pipeline::{
    GeneratedAudio, GenerationPipeline, GenerationSettings, DEFAULT_FINE_TEMPERATURE,
};
pub use progress::{LogProgress, NoProgress, ProgressReporter};
pub use voices::VoiceLibrary;
