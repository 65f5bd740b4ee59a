//! Semantic tokens → the first two codec codebooks.
//!
//! The coarse model predicts both codebooks as one interleaved stream
//! `[c0(t0), c1(t0), c0(t1), c1(t1), ...]`, each codebook shifted into its own
//! id range above the semantic vocabulary. Long inputs are generated in
//! sliding windows whose context is rebuilt from the semantic ids around the
//! current position plus the most recent coarse ids.

use std::time::Instant;

use tracing::{debug, info};

use super::sampling::TokenSampler;
use super::traits::CausalLm;
use super::{
    CODEBOOK_SIZE, COARSE_INFER_TOKEN, COARSE_RATE_HZ, COARSE_SEMANTIC_PAD_TOKEN,
    N_COARSE_CODEBOOKS, SEMANTIC_RATE_HZ, SEMANTIC_VOCAB_SIZE,
};
use crate::bundle::{CodebookTokens, HistoryPrompt, SemanticTokens};
use crate::error::{BarkError, Result};

/// Semantic positions in every coarse window context.
const SEMANTIC_WINDOW: usize = 256;

#[derive(Debug, Clone)]
pub struct CoarseOptions {
    pub temperature: f64,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    /// Flattened coarse ids kept in each window context.
    pub max_coarse_history: usize,
    /// Steps generated before the context is rebuilt.
    pub sliding_window_len: usize,
    pub use_kv_caching: bool,
    pub silent: bool,
    pub seed: u64,
}

impl Default for CoarseOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: None,
            top_p: None,
            max_coarse_history: 630,
            sliding_window_len: 60,
            use_kv_caching: false,
            silent: false,
            seed: 0,
        }
    }
}

/// Flattened coarse ids per semantic id.
pub fn semantic_to_coarse_ratio() -> f64 {
    COARSE_RATE_HZ / SEMANTIC_RATE_HZ * N_COARSE_CODEBOOKS as f64
}

fn flat_offset(row: usize) -> u32 {
    (SEMANTIC_VOCAB_SIZE + row * CODEBOOK_SIZE) as u32
}

/// Interleave codebook rows frame by frame, shifting row `n` by its offset.
fn flatten_codebooks(tokens: &CodebookTokens) -> Vec<u32> {
    let mut flat = Vec::with_capacity(tokens.n_codebooks() * tokens.n_frames());
    for t in 0..tokens.n_frames() {
        for row in 0..tokens.n_codebooks() {
            flat.push(tokens.get(row, t) + flat_offset(row));
        }
    }
    flat
}

fn unflatten_codebooks(flat: &[u32]) -> Result<CodebookTokens> {
    let mut rows = vec![Vec::with_capacity(flat.len() / N_COARSE_CODEBOOKS); N_COARSE_CODEBOOKS];
    for (i, &id) in flat.iter().enumerate() {
        let row = i % N_COARSE_CODEBOOKS;
        rows[row].push(id - flat_offset(row));
    }
    CodebookTokens::from_rows(rows)
}

/// Aligned semantic / flattened-coarse history, or two empty vectors.
fn trimmed_history(
    history: Option<HistoryPrompt<'_>>,
    max_semantic_history: usize,
    ratio: f64,
) -> Result<(Vec<u32>, Vec<u32>)> {
    let (semantic, coarse) = match history {
        Some(HistoryPrompt {
            semantic_prompt: Some(s),
            coarse_prompt: Some(c),
            ..
        }) => (s.as_slice(), c),
        _ => return Ok((Vec::new(), Vec::new())),
    };
    if coarse.n_codebooks() != N_COARSE_CODEBOOKS {
        return Err(BarkError::Format(format!(
            "coarse history must have {N_COARSE_CODEBOOKS} rows, got {}",
            coarse.n_codebooks()
        )));
    }
    let coarse_flat = flatten_codebooks(coarse);

    let n_semantic = max_semantic_history
        .min(semantic.len() - semantic.len() % 2)
        .min((coarse_flat.len() as f64 / ratio).floor() as usize);
    let n_coarse = ((n_semantic as f64 * ratio).round() as usize).min(coarse_flat.len());

    let semantic = semantic[semantic.len() - n_semantic..].to_vec();
    let mut coarse = coarse_flat[coarse_flat.len() - n_coarse..].to_vec();
    // Dropping the last two entries keeps the histories time aligned.
    coarse.truncate(coarse.len().saturating_sub(2));
    Ok((semantic, coarse))
}

pub struct CoarseStage {
    model: Box<dyn CausalLm>,
}

impl CoarseStage {
    pub fn new(model: Box<dyn CausalLm>) -> Self {
        Self { model }
    }

    /// Generate the coarse continuation for `semantic`. The history, when
    /// given, only conditions the output and is not part of it.
    pub fn generate(
        &mut self,
        semantic: &SemanticTokens,
        history: Option<HistoryPrompt<'_>>,
        opts: &CoarseOptions,
    ) -> Result<CodebookTokens> {
        if opts.max_coarse_history == 0 || opts.sliding_window_len == 0 {
            return Err(BarkError::InvalidConfiguration(format!(
                "max_coarse_history ({}) and sliding_window_len ({}) must be positive",
                opts.max_coarse_history, opts.sliding_window_len
            )));
        }
        if let Some(bad) = semantic
            .as_slice()
            .iter()
            .find(|&&id| id as usize >= SEMANTIC_VOCAB_SIZE)
        {
            return Err(BarkError::Format(format!(
                "semantic input contains id {bad}, expected ids below {SEMANTIC_VOCAB_SIZE}"
            )));
        }

        let ratio = semantic_to_coarse_ratio();
        let max_semantic_history = (opts.max_coarse_history as f64 / ratio).floor() as usize;
        let (semantic_history, coarse_history) =
            trimmed_history(history, max_semantic_history, ratio)?;

        let n_steps = ((semantic.len() as f64 * ratio / N_COARSE_CODEBOOKS as f64).floor()
            * N_COARSE_CODEBOOKS as f64)
            .round() as usize;

        let base_semantic_idx = semantic_history.len();
        let mut x_semantic = semantic_history;
        x_semantic.extend_from_slice(semantic.as_slice());
        let mut x_coarse = coarse_history;
        let n_history = x_coarse.len();

        let mut sampler = TokenSampler::new(opts.seed, opts.temperature, opts.top_k, opts.top_p);
        let start = Instant::now();

        let result = self.decode_windows(
            &x_semantic,
            &mut x_coarse,
            base_semantic_idx,
            max_semantic_history,
            n_steps,
            &mut sampler,
            opts,
        );
        self.model.clear_kv_cache();
        result?;

        let out = unflatten_codebooks(&x_coarse[n_history..])?;
        if !opts.silent {
            info!(
                frames = out.n_frames(),
                history = n_history,
                elapsed = ?start.elapsed(),
                "coarse stage finished"
            );
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_windows(
        &mut self,
        x_semantic: &[u32],
        x_coarse: &mut Vec<u32>,
        base_semantic_idx: usize,
        max_semantic_history: usize,
        n_steps: usize,
        sampler: &mut TokenSampler,
        opts: &CoarseOptions,
    ) -> Result<()> {
        let ratio = semantic_to_coarse_ratio();
        let mut n_step = 0;
        let mut window = 0;
        while n_step < n_steps {
            let semantic_idx = base_semantic_idx + (n_step as f64 / ratio).round() as usize;
            let from = semantic_idx
                .saturating_sub(max_semantic_history)
                .min(x_semantic.len());
            let until = (from + SEMANTIC_WINDOW).min(x_semantic.len());

            let mut x_in = x_semantic[from..until].to_vec();
            x_in.resize(SEMANTIC_WINDOW, COARSE_SEMANTIC_PAD_TOKEN);
            x_in.push(COARSE_INFER_TOKEN);
            let history_start = x_coarse.len().saturating_sub(opts.max_coarse_history);
            x_in.extend_from_slice(&x_coarse[history_start..]);

            self.model.clear_kv_cache();
            for i in 0..opts.sliding_window_len {
                if n_step >= n_steps {
                    break;
                }
                let is_major = n_step % N_COARSE_CODEBOOKS == 0;
                let input = if opts.use_kv_caching && i > 0 {
                    &x_in[x_in.len() - 1..]
                } else {
                    &x_in[..]
                };
                let logits = self.model.forward(input, false, opts.use_kv_caching)?;

                let logit_start = SEMANTIC_VOCAB_SIZE + usize::from(!is_major) * CODEBOOK_SIZE;
                let relevant = logits.narrow(0, logit_start, CODEBOOK_SIZE)?;
                let next = sampler.sample(&relevant)? + logit_start as u32;

                x_coarse.push(next);
                x_in.push(next);
                n_step += 1;
            }
            if !opts.silent {
                debug!(window, n_step, n_steps, "coarse window done");
            }
            window += 1;
        }
        Ok(())
    }
}
