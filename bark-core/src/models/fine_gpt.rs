//! Non-causal transformer that fills in the fine codebooks.

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{embedding, Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

use super::gpt::{layer_norm, Block};
use crate::generation::FineLm;

fn default_bias() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct FineGptConfig {
    pub block_size: usize,
    pub input_vocab_size: usize,
    pub output_vocab_size: usize,
    #[serde(alias = "num_layers")]
    pub n_layer: usize,
    #[serde(alias = "num_heads")]
    pub n_head: usize,
    #[serde(alias = "hidden_size")]
    pub n_embd: usize,
    #[serde(default = "default_bias")]
    pub bias: bool,
    pub n_codes_total: usize,
    pub n_codes_given: usize,
}

pub struct FineGpt {
    wtes: Vec<Embedding>,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_heads: Vec<Linear>,
    n_codes_total: usize,
    n_codes_given: usize,
    device: Device,
}

impl FineGpt {
    pub fn new(cfg: &FineGptConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.n_codes_given == 0 || cfg.n_codes_given >= cfg.n_codes_total {
            candle_core::bail!(
                "fine model needs 0 < n_codes_given ({}) < n_codes_total ({})",
                cfg.n_codes_given,
                cfg.n_codes_total
            );
        }
        let vb_t = vb.pp("transformer");
        let wtes = (0..cfg.n_codes_total)
            .map(|i| embedding(cfg.input_vocab_size, cfg.n_embd, vb_t.pp("wtes").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let blocks = (0..cfg.n_layer)
            .map(|i| Block::new(cfg.n_embd, cfg.n_head, cfg.bias, vb_t.pp("h").pp(i)))
            .collect::<Result<Vec<_>>>()?;

        // Heads are tied to the embedding of the codebook they predict and
        // may be absent from the checkpoint.
        let vb_heads = vb.pp("lm_heads");
        let mut lm_heads = Vec::with_capacity(cfg.n_codes_total - cfg.n_codes_given);
        for i in 0..cfg.n_codes_total - cfg.n_codes_given {
            let name = format!("{i}.weight");
            let weight = if vb_heads.contains_tensor(&name) {
                vb_heads.get((cfg.output_vocab_size, cfg.n_embd), &name)?
            } else {
                wtes[i + 1].embeddings().clone()
            };
            lm_heads.push(Linear::new(weight, None));
        }

        Ok(Self {
            wtes,
            wpe: embedding(cfg.block_size, cfg.n_embd, vb_t.pp("wpe"))?,
            blocks,
            ln_f: layer_norm(cfg.n_embd, cfg.bias, vb_t.pp("ln_f"))?,
            lm_heads,
            n_codes_total: cfg.n_codes_total,
            n_codes_given: cfg.n_codes_given,
            device: vb.device().clone(),
        })
    }
}

impl FineLm for FineGpt {
    fn device(&self) -> &Device {
        &self.device
    }

    fn n_codes_total(&self) -> usize {
        self.n_codes_total
    }

    fn n_codes_given(&self) -> usize {
        self.n_codes_given
    }

    fn forward(&self, pred_idx: usize, codes: &Tensor) -> Result<Tensor> {
        if pred_idx < self.n_codes_given || pred_idx >= self.n_codes_total {
            candle_core::bail!(
                "cannot predict codebook {pred_idx} with {} given of {}",
                self.n_codes_given,
                self.n_codes_total
            );
        }
        let (_, seq_len, n_codes) = codes.dims3()?;
        if n_codes != self.n_codes_total {
            candle_core::bail!("expected {} codebooks, got {n_codes}", self.n_codes_total);
        }
        let codes = codes.to_dtype(DType::U32)?;

        let mut x = self.wtes[0].forward(&codes.narrow(2, 0, 1)?.squeeze(2)?)?;
        for (i, wte) in self.wtes.iter().enumerate().take(pred_idx + 1).skip(1) {
            x = (x + wte.forward(&codes.narrow(2, i, 1)?.squeeze(2)?)?)?;
        }
        let positions = Tensor::arange(0u32, seq_len as u32, &self.device)?.unsqueeze(0)?;
        let mut x = x.broadcast_add(&self.wpe.forward(&positions)?)?;
        for block in &self.blocks {
            x = block.forward_stateless(&x)?;
        }
        let x = self.ln_f.forward(&x)?;
        self.lm_heads[pred_idx - self.n_codes_given]
            .forward(&x)?
            .to_dtype(DType::F32)
    }
}
