//! Seeded token sampling shared by the stages.
//!
//! Greedy decoding when temperature ≤ 0, otherwise multinomial sampling with
//! optional top-k / top-p filtering through candle's `LogitsProcessor`.

use candle_core::{DType, Result, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};

pub struct TokenSampler {
    processor: LogitsProcessor,
    temperature: f64,
    top_k: Option<usize>,
    top_p: Option<f64>,
}

impl TokenSampler {
    pub fn new(seed: u64, temperature: f64, top_k: Option<usize>, top_p: Option<f64>) -> Self {
        let top_p = top_p.filter(|p| *p > 0.0 && *p < 1.0);
        let sampling = if temperature <= 0.0 {
            Sampling::ArgMax
        } else {
            match (top_k, top_p) {
                (None, None) => Sampling::All { temperature },
                (Some(k), None) => Sampling::TopK { k, temperature },
                (None, Some(p)) => Sampling::TopP { p, temperature },
                (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
            }
        };
        Self {
            processor: LogitsProcessor::from_sampling(seed, sampling),
            temperature,
            top_k,
            top_p,
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Draw one token from rank-1 `logits`.
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        self.processor.sample(&logits.to_dtype(DType::F32)?)
    }

    /// Probability of index `idx` in the distribution [`sample`](Self::sample)
    /// draws from: `softmax(logits / temperature)` after top-k then top-p,
    /// renormalized.
    ///
    /// Greedy samplers report 1.0 for the argmax and 0.0 elsewhere.
    pub fn probability_of(&self, logits: &Tensor, idx: usize) -> Result<f32> {
        let logits = logits.to_dtype(DType::F32)?;
        if self.is_greedy() {
            let best = logits.argmax(0)?.to_scalar::<u32>()? as usize;
            return Ok(if best == idx { 1.0 } else { 0.0 });
        }
        let probs = candle_nn::ops::softmax_last_dim(&(logits / self.temperature)?)?;
        let kept = self.filter(probs.to_vec1::<f32>()?);
        let total: f32 = kept.iter().sum();
        if total <= 0.0 {
            return Ok(0.0);
        }
        Ok(kept.get(idx).copied().unwrap_or(0.0) / total)
    }

    /// Zero the probabilities `LogitsProcessor` would never draw.
    fn filter(&self, mut probs: Vec<f32>) -> Vec<f32> {
        if self.top_k.is_none() && self.top_p.is_none() {
            return probs;
        }
        let mut order: Vec<usize> = (0..probs.len()).collect();
        order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
        if let Some(k) = self.top_k {
            for &i in order.iter().skip(k) {
                probs[i] = 0.0;
            }
        }
        if let Some(p) = self.top_p {
            let mut cumsum = 0.0f32;
            for &i in &order {
                if f64::from(cumsum) >= p {
                    probs[i] = 0.0;
                } else {
                    cumsum += probs[i];
                }
            }
        }
        probs
    }
}
