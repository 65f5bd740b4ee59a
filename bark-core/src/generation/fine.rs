//! Coarse codebooks → full codec depth.
//!
//! The fine model is non-causal: it sees a whole 1024-frame window and fills
//! in one codebook at a time, conditioned on every codebook below it. Windows
//! advance by 512 frames so each one overlaps the previous half.

use std::time::Instant;

use candle_core::{Tensor, D};
use tracing::{debug, info};

use super::sampling::TokenSampler;
use super::traits::FineLm;
use super::CODEBOOK_SIZE;
use crate::bundle::{CodebookTokens, HistoryPrompt};
use crate::error::{BarkError, Result};

/// Frames seen by the fine model at once.
pub const FINE_WINDOW: usize = 1024;
/// Frames of fine history prepended, and the stride between windows.
pub const FINE_HISTORY: usize = 512;

#[derive(Debug, Clone, Default)]
pub struct FineOptions {
    /// `None` decodes greedily.
    pub temperature: Option<f64>,
    pub seed: u64,
}

pub struct FineStage {
    model: Box<dyn FineLm>,
}

impl FineStage {
    pub fn new(model: Box<dyn FineLm>) -> Self {
        Self { model }
    }

    pub fn n_codebooks(&self) -> usize {
        self.model.n_codes_total()
    }

    /// Fill codebooks `coarse.n_codebooks()..` for every frame of `coarse`.
    ///
    /// The leading rows of the output are `coarse` unchanged and the frame
    /// count is preserved.
    pub fn generate(
        &self,
        coarse: &CodebookTokens,
        history: Option<HistoryPrompt<'_>>,
        opts: &FineOptions,
    ) -> Result<CodebookTokens> {
        let n_total = self.model.n_codes_total();
        let n_coarse = coarse.n_codebooks();
        if n_coarse > n_total || n_coarse < self.model.n_codes_given() {
            return Err(BarkError::InvalidConfiguration(format!(
                "fine model predicts codebooks {}..{n_total}, got a {n_coarse}-row input",
                self.model.n_codes_given()
            )));
        }
        if let Some(max) = coarse.max_id() {
            if max as usize >= CODEBOOK_SIZE {
                return Err(BarkError::Format(format!(
                    "coarse input contains id {max}, expected ids below {CODEBOOK_SIZE}"
                )));
            }
        }
        let n_frames = coarse.n_frames();
        if n_frames == 0 {
            return CodebookTokens::new(n_total, 0, Vec::new());
        }

        let fine_history = match history.and_then(|h| h.fine_prompt) {
            Some(prompt) if prompt.n_codebooks() != n_total => {
                return Err(BarkError::Format(format!(
                    "fine history must have {n_total} rows, got {}",
                    prompt.n_codebooks()
                )));
            }
            Some(prompt) => Some(prompt.last_frames(FINE_HISTORY)),
            None => None,
        };
        let n_history = fine_history.as_ref().map_or(0, CodebookTokens::n_frames);

        // Time-major buffer: `buf[t * n_total + c]`.
        let mut total = n_history + n_frames;
        let mut buf = Vec::with_capacity(total.max(FINE_WINDOW) * n_total);
        if let Some(h) = &fine_history {
            for t in 0..n_history {
                buf.extend(h.frame(t));
            }
        }
        for t in 0..n_frames {
            buf.extend(coarse.frame(t));
            buf.extend(std::iter::repeat(CODEBOOK_SIZE as u32).take(n_total - n_coarse));
        }
        if total < FINE_WINDOW {
            buf.resize(FINE_WINDOW * n_total, CODEBOOK_SIZE as u32);
            total = FINE_WINDOW;
        }

        let uncovered = n_frames as f64 - (FINE_WINDOW - n_history) as f64;
        let n_loops = (uncovered / FINE_HISTORY as f64).ceil().max(0.0) as usize + 1;

        let mut sampler = opts
            .temperature
            .map(|temp| TokenSampler::new(opts.seed, temp, None, None));
        let device = self.model.device().clone();
        let start = Instant::now();

        for n in 0..n_loops {
            let start_idx = (n * FINE_HISTORY).min(total - FINE_WINDOW);
            let fill_idx = (n_history + n * FINE_HISTORY).min(total - FINE_HISTORY);
            let rel = fill_idx - start_idx;

            let mut window =
                buf[start_idx * n_total..(start_idx + FINE_WINDOW) * n_total].to_vec();
            for pred_idx in n_coarse..n_total {
                let codes =
                    Tensor::from_slice(window.as_slice(), (1, FINE_WINDOW, n_total), &device)?;
                let logits = self
                    .model
                    .forward(pred_idx, &codes)?
                    .squeeze(0)?
                    .narrow(1, 0, CODEBOOK_SIZE)?
                    .narrow(0, rel, FINE_WINDOW - rel)?;
                let preds = match sampler.as_mut() {
                    None => logits.argmax(D::Minus1)?.to_vec1::<u32>()?,
                    Some(sampler) => (0..FINE_WINDOW - rel)
                        .map(|i| sampler.sample(&logits.get(i)?))
                        .collect::<candle_core::Result<Vec<_>>>()?,
                };
                for (i, id) in preds.into_iter().enumerate() {
                    window[(rel + i) * n_total + pred_idx] = id;
                }
            }
            for t in rel..FINE_WINDOW {
                let dst = (start_idx + t) * n_total;
                buf[dst + n_coarse..dst + n_total]
                    .copy_from_slice(&window[t * n_total + n_coarse..(t + 1) * n_total]);
            }
            debug!(window = n, n_loops, start_idx, fill_idx, "fine window done");
        }

        let mut rows = vec![Vec::with_capacity(n_frames); n_total];
        for t in n_history..n_history + n_frames {
            for (c, row) in rows.iter_mut().enumerate() {
                row.push(buf[t * n_total + c]);
            }
        }
        let out = CodebookTokens::from_rows(rows)?;
        info!(
            frames = n_frames,
            codebooks = n_total,
            history = n_history,
            elapsed = ?start.elapsed(),
            "fine stage finished"
        );
        Ok(out)
    }
}
