//! Text → semantic tokens.

use std::time::Instant;

use candle_core::Tensor;
use tracing::{debug, info, warn};

use super::sampling::TokenSampler;
use super::traits::{CausalLm, TextEncoder};
use super::{
    MAX_SEMANTIC_HISTORY, MAX_TEXT_TOKENS, SEMANTIC_INFER_TOKEN, SEMANTIC_PAD_TOKEN,
    SEMANTIC_RATE_HZ, SEMANTIC_VOCAB_SIZE, TEXT_ENCODING_OFFSET, TEXT_PAD_TOKEN,
};
use crate::bundle::{HistoryPrompt, SemanticTokens};
use crate::error::{BarkError, Result};

/// Upper bound on decoding steps regardless of duration.
pub const SEMANTIC_MAX_STEPS: usize = 768;

pub const DEFAULT_MIN_EOS_P: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct SemanticOptions {
    pub temperature: f64,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    /// Stop once the end-of-sequence probability reaches this value.
    pub min_eos_p: f64,
    /// Bound on generated audio length; `None` leaves only [`SEMANTIC_MAX_STEPS`].
    pub max_duration_s: Option<f64>,
    pub allow_early_stop: bool,
    pub use_kv_caching: bool,
    pub silent: bool,
    pub seed: u64,
}

impl Default for SemanticOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: None,
            top_p: None,
            min_eos_p: DEFAULT_MIN_EOS_P,
            max_duration_s: None,
            allow_early_stop: true,
            use_kv_caching: false,
            silent: false,
            seed: 0,
        }
    }
}

/// Token budget implied by a duration at the semantic frame rate.
pub fn semantic_token_budget(max_duration_s: f64) -> Result<usize> {
    let budget = (max_duration_s * SEMANTIC_RATE_HZ).floor();
    if !budget.is_finite() || budget < 1.0 {
        return Err(BarkError::InvalidConfiguration(format!(
            "max duration of {max_duration_s}s yields no semantic tokens at {SEMANTIC_RATE_HZ} Hz"
        )));
    }
    Ok(budget as usize)
}

pub struct SemanticStage {
    model: Box<dyn CausalLm>,
    tokenizer: Box<dyn TextEncoder>,
}

impl SemanticStage {
    pub fn new(model: Box<dyn CausalLm>, tokenizer: Box<dyn TextEncoder>) -> Self {
        Self { model, tokenizer }
    }

    /// Collapse whitespace, encode, offset into the text range and pad to
    /// [`MAX_TEXT_TOKENS`].
    fn encode_text(&self, text: &str) -> Result<Vec<u32>> {
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut ids: Vec<u32> = self
            .tokenizer
            .encode(&text)?
            .into_iter()
            .map(|id| id + TEXT_ENCODING_OFFSET)
            .collect();
        if ids.len() > MAX_TEXT_TOKENS {
            warn!(
                tokens = ids.len(),
                kept = MAX_TEXT_TOKENS,
                "text went over {MAX_TEXT_TOKENS} tokens, truncating"
            );
            ids.truncate(MAX_TEXT_TOKENS);
        }
        ids.resize(MAX_TEXT_TOKENS, TEXT_PAD_TOKEN);
        Ok(ids)
    }

    fn history_ids(history: Option<HistoryPrompt<'_>>) -> Result<Vec<u32>> {
        let mut ids = match history.and_then(|h| h.semantic_prompt) {
            Some(prompt) => {
                let ids = prompt.as_slice();
                if let Some(bad) = ids.iter().find(|&&id| id as usize >= SEMANTIC_VOCAB_SIZE) {
                    return Err(BarkError::Format(format!(
                        "semantic history contains id {bad}, expected ids below {SEMANTIC_VOCAB_SIZE}"
                    )));
                }
                ids[ids.len().saturating_sub(MAX_SEMANTIC_HISTORY)..].to_vec()
            }
            None => Vec::with_capacity(MAX_SEMANTIC_HISTORY),
        };
        ids.resize(MAX_SEMANTIC_HISTORY, SEMANTIC_PAD_TOKEN);
        Ok(ids)
    }

    /// Generate semantic tokens for `text`, optionally continuing a voice.
    pub fn generate(
        &mut self,
        text: &str,
        history: Option<HistoryPrompt<'_>>,
        opts: &SemanticOptions,
    ) -> Result<SemanticTokens> {
        let budget = match opts.max_duration_s {
            Some(d) => semantic_token_budget(d)?.min(SEMANTIC_MAX_STEPS),
            None => SEMANTIC_MAX_STEPS,
        };

        let mut x = self.encode_text(text)?;
        x.extend(Self::history_ids(history)?);
        x.push(SEMANTIC_INFER_TOKEN);
        let prefix_len = x.len();

        let mut sampler = TokenSampler::new(opts.seed, opts.temperature, opts.top_k, opts.top_p);
        let start = Instant::now();

        self.model.clear_kv_cache();
        let result = self.decode_loop(&mut x, prefix_len, budget, &mut sampler, opts);
        self.model.clear_kv_cache();
        result?;

        let out = SemanticTokens::new(x.split_off(prefix_len));
        if !opts.silent {
            info!(
                tokens = out.len(),
                budget,
                kv_cache = opts.use_kv_caching,
                elapsed = ?start.elapsed(),
                "semantic stage finished"
            );
        }
        Ok(out)
    }

    fn decode_loop(
        &mut self,
        x: &mut Vec<u32>,
        prefix_len: usize,
        budget: usize,
        sampler: &mut TokenSampler,
        opts: &SemanticOptions,
    ) -> Result<()> {
        let eos_idx = SEMANTIC_VOCAB_SIZE;
        for step in 0..budget {
            let input = if opts.use_kv_caching && step > 0 {
                &x[x.len() - 1..]
            } else {
                &x[..]
            };
            let logits = self.model.forward(input, true, opts.use_kv_caching)?;

            let mut relevant = logits.narrow(0, 0, SEMANTIC_VOCAB_SIZE)?;
            if opts.allow_early_stop {
                let eos = logits.narrow(0, SEMANTIC_PAD_TOKEN as usize, 1)?;
                relevant = Tensor::cat(&[&relevant, &eos], 0)?;
            }

            let next = sampler.sample(&relevant)?;
            if opts.allow_early_stop {
                let eos_p = sampler.probability_of(&relevant, eos_idx)?;
                if next as usize == eos_idx || f64::from(eos_p) >= opts.min_eos_p {
                    debug!(step, eos_p, "semantic stage reached end of sequence");
                    break;
                }
            }
            x.push(next);

            if !opts.silent && step % 100 == 0 {
                debug!(step, generated = x.len() - prefix_len, "semantic decoding");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ByteTokenizer, MockCausalLm, MockCausalLmStats};

    fn stage(eos_logit: f32) -> (SemanticStage, MockCausalLmStats) {
        let model = MockCausalLm::new(10_048).with_eos(SEMANTIC_PAD_TOKEN as usize, eos_logit);
        let stats = model.stats();
        (SemanticStage::new(Box::new(model), Box::new(ByteTokenizer)), stats)
    }

    #[test]
    fn kv_caching_does_not_change_greedy_output() {
        let opts = SemanticOptions {
            temperature: 0.0,
            max_duration_s: Some(2.0),
            silent: true,
            ..Default::default()
        };
        let (mut cached, cached_stats) = stage(-100.0);
        let (mut uncached, _) = stage(-100.0);

        let a = cached
            .generate(
                "Hello world.",
                None,
                &SemanticOptions {
                    use_kv_caching: true,
                    ..opts.clone()
                },
            )
            .unwrap();
        let b = uncached.generate("Hello world.", None, &opts).unwrap();

        assert_eq!(a, b);
        assert!(!a.is_empty());
        // Only the first step sees the whole context when cached.
        assert_eq!(cached_stats.max_input_len_after_first(), Some(1));
    }

    #[test]
    fn kv_caching_does_not_change_sampled_output_for_a_fixed_seed() {
        let opts = SemanticOptions {
            temperature: 0.9,
            max_duration_s: Some(1.0),
            silent: true,
            seed: 1234,
            ..Default::default()
        };
        let (mut cached, _) = stage(-100.0);
        let (mut uncached, _) = stage(-100.0);
        let a = cached
            .generate("caching", None, &SemanticOptions { use_kv_caching: true, ..opts.clone() })
            .unwrap();
        let b = uncached.generate("caching", None, &opts).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn duration_bounds_the_number_of_tokens() {
        let (mut stage, _) = stage(-100.0);
        let opts = SemanticOptions {
            temperature: 0.0,
            max_duration_s: Some(3.0),
            silent: true,
            ..Default::default()
        };
        let out = stage.generate("Testing one two three", None, &opts).unwrap();
        assert_eq!(out.len(), (3.0 * SEMANTIC_RATE_HZ).floor() as usize);
    }

    #[test]
    fn non_positive_budget_is_rejected() {
        let (mut stage, stats) = stage(-100.0);
        for d in [0.0, 0.01, -1.0, f64::NAN] {
            let opts = SemanticOptions {
                max_duration_s: Some(d),
                ..Default::default()
            };
            let err = stage.generate("hi", None, &opts).unwrap_err();
            assert!(matches!(err, BarkError::InvalidConfiguration(_)));
        }
        assert_eq!(stats.calls(), 0);
    }

    #[test]
    fn high_eos_probability_stops_immediately() {
        let (mut stage, _) = stage(50.0);
        let out = stage
            .generate("stop", None, &SemanticOptions { silent: true, ..Default::default() })
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn history_prompt_changes_the_context() {
        let (mut stage, stats) = stage(-100.0);
        let history = SemanticTokens::new(vec![7; 300]);
        let prompt = HistoryPrompt {
            semantic_prompt: Some(&history),
            ..Default::default()
        };
        let opts = SemanticOptions {
            temperature: 0.0,
            max_duration_s: Some(0.1),
            use_kv_caching: true,
            silent: true,
            ..Default::default()
        };
        stage.generate("voice", Some(prompt), &opts).unwrap();

        let first = stats.first_input().unwrap();
        assert_eq!(first.len(), MAX_TEXT_TOKENS + MAX_SEMANTIC_HISTORY + 1);
        // Only the last 256 history ids survive, none of them padding.
        assert!(first[MAX_TEXT_TOKENS..MAX_TEXT_TOKENS + MAX_SEMANTIC_HISTORY]
            .iter()
            .all(|&id| id == 7));
        assert_eq!(*first.last().unwrap(), SEMANTIC_INFER_TOKEN);
    }

    #[test]
    fn text_is_offset_and_padded() {
        let (stage, _) = stage(-100.0);
        let ids = stage.encode_text("  a\n\tb ").unwrap();
        assert_eq!(ids.len(), MAX_TEXT_TOKENS);
        assert_eq!(&ids[..3], &[
            b'a' as u32 + TEXT_ENCODING_OFFSET,
            b' ' as u32 + TEXT_ENCODING_OFFSET,
            b'b' as u32 + TEXT_ENCODING_OFFSET
        ]);
        assert!(ids[3..].iter().all(|&id| id == TEXT_PAD_TOKEN));
    }
}
