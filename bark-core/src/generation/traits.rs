//! Capabilities the stages call into.
//!
//! The stages own the decoding loops; these traits only expose one forward
//! pass at a time so any backend (the candle models in [`crate::models`], a
//! remote service, a test double) can sit behind them.

use candle_core::{Device, Result, Tensor};

/// Autoregressive token model used by the semantic and coarse stages.
pub trait CausalLm: Send {
    fn device(&self) -> &Device;

    /// Run `input_ids` and return the logits of the last position as a rank-1
    /// f32 tensor over the output vocabulary.
    ///
    /// With `use_cache` the keys/values of every processed position are kept,
    /// so the next call may pass only the newest token. Without it no state
    /// survives the call. `merge_context` asks the model to sum the text and
    /// history embeddings of the first 512 positions; it is ignored once a
    /// cache is populated.
    fn forward(&mut self, input_ids: &[u32], merge_context: bool, use_cache: bool)
        -> Result<Tensor>;

    fn clear_kv_cache(&mut self);
}

/// Non-causal model that fills in the fine codebooks.
pub trait FineLm: Send {
    fn device(&self) -> &Device;

    /// Total number of codebooks the model reads and writes.
    fn n_codes_total(&self) -> usize;

    /// Number of leading codebooks that are always given (never predicted).
    fn n_codes_given(&self) -> usize;

    /// `codes`: `[1, t, n_codes_total]` u32. Returns `[1, t, vocab]` logits for
    /// codebook `pred_idx`.
    fn forward(&self, pred_idx: usize, codes: &Tensor) -> Result<Tensor>;
}

/// Neural audio codec: waveform <-> multi-level discrete tokens.
pub trait AudioCodec: Send {
    fn device(&self) -> &Device;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> usize;

    fn n_codebooks(&self) -> usize;

    /// Samples per codec frame.
    fn hop_length(&self) -> usize;

    /// `[1, channels, samples]` f32 at the codec rate → `[1, n_codebooks, frames]` u32.
    fn encode(&self, wav: &Tensor) -> Result<Tensor>;

    /// `[1, n_codebooks, frames]` u32 → `[1, channels, samples]` f32.
    fn decode(&self, codes: &Tensor) -> Result<Tensor>;
}

/// Text → token ids, without special tokens.
pub trait TextEncoder: Send {
    fn encode(&self, text: &str) -> crate::Result<Vec<u32>>;
}

impl TextEncoder for tokenizers::Tokenizer {
    fn encode(&self, text: &str) -> crate::Result<Vec<u32>> {
        let encoding = std::ops::Deref::deref(self)
            .encode(text, false)
            .map_err(|e| crate::BarkError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }
}
