//! GPT-2 style causal transformer used by the semantic and coarse stages.

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{embedding, linear_b, linear_no_bias, Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

use crate::generation::CausalLm;

/// Text and history segments summed by `merge_context`.
const MERGED_SEGMENT: usize = 256;

fn default_bias() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct GptConfig {
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
}

pub(crate) fn layer_norm(size: usize, bias: bool, vb: VarBuilder) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
    if bias {
        let bias = vb.get_with_hints(size, "bias", candle_nn::Init::Const(0.0))?;
        Ok(LayerNorm::new(weight, bias, 1e-5))
    } else {
        Ok(LayerNorm::new_no_bias(weight, 1e-5))
    }
}

/// Mask for `seq_len` new positions over `offset` cached ones.
/// Shape: `[1, 1, seq_len, offset + seq_len]`.
fn build_causal_mask_with_offset(
    seq_len: usize,
    offset: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let full_len = offset + seq_len;
    let mut mask_data = vec![0f32; seq_len * full_len];
    for i in 0..seq_len {
        for j in (offset + i + 1)..full_len {
            mask_data[i * full_len + j] = f32::NEG_INFINITY;
        }
    }
    Tensor::new(mask_data.as_slice(), device)?
        .reshape((1, 1, seq_len, full_len))?
        .to_dtype(dtype)
}

pub(crate) struct SelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl SelfAttention {
    pub(crate) fn new(n_embd: usize, n_head: usize, bias: bool, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            c_attn: linear_b(n_embd, 3 * n_embd, bias, vb.pp("c_attn"))?,
            c_proj: linear_b(n_embd, n_embd, bias, vb.pp("c_proj"))?,
            n_head,
            kv_cache: None,
        })
    }

    fn cached_len(&self) -> usize {
        self.kv_cache
            .as_ref()
            .map_or(0, |(k, _)| k.dims().get(2).copied().unwrap_or(0))
    }

    fn project(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (b_sz, seq_len, n_embd) = x.dims3()?;
        let head_dim = n_embd / self.n_head;
        let qkv = self.c_attn.forward(x)?;
        let split = |i: usize| -> Result<Tensor> {
            qkv.narrow(2, i * n_embd, n_embd)?
                .reshape((b_sz, seq_len, self.n_head, head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        Ok((split(0)?, split(1)?, split(2)?))
    }

    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b_sz, _, seq_len, head_dim) = q.dims4()?;
        let scale = 1.0 / (head_dim as f64).sqrt();
        let att = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * scale)?;
        let att = match mask {
            Some(mask) => att.broadcast_add(mask)?,
            None => att,
        };
        let input_dtype = att.dtype();
        let att =
            candle_nn::ops::softmax_last_dim(&att.to_dtype(DType::F32)?)?.to_dtype(input_dtype)?;
        let y = att
            .matmul(v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b_sz, seq_len, self.n_head * head_dim))?;
        self.c_proj.forward(&y)
    }

    /// With `use_cache`, keys and values are appended to the cache and the
    /// queries attend over everything cached so far.
    pub(crate) fn forward(
        &mut self,
        x: &Tensor,
        mask: Option<&Tensor>,
        use_cache: bool,
    ) -> Result<Tensor> {
        let (q, k, v) = self.project(x)?;
        if !use_cache {
            return self.attend(&q, &k, &v, mask);
        }
        let (k, v) = match self.kv_cache.take() {
            Some((ck, cv)) => (Tensor::cat(&[&ck, &k], 2)?, Tensor::cat(&[&cv, &v], 2)?),
            None => (k, v),
        };
        self.kv_cache = Some((k.clone(), v.clone()));
        self.attend(&q, &k, &v, mask)
    }

    pub(crate) fn forward_stateless(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (q, k, v) = self.project(x)?;
        self.attend(&q, &k, &v, mask)
    }

    fn clear_kv_cache(&mut self) {
        self.kv_cache = None;
    }
}

struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    fn new(n_embd: usize, bias: bool, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            c_fc: linear_b(n_embd, 4 * n_embd, bias, vb.pp("c_fc"))?,
            c_proj: linear_b(4 * n_embd, n_embd, bias, vb.pp("c_proj"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.c_proj.forward(&self.c_fc.forward(xs)?.gelu_erf()?)
    }
}

/// Pre-LN transformer block shared by the causal and fine models.
pub(crate) struct Block {
    ln_1: LayerNorm,
    attn: SelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    pub(crate) fn new(n_embd: usize, n_head: usize, bias: bool, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(n_embd, bias, vb.pp("ln_1"))?,
            attn: SelfAttention::new(n_embd, n_head, bias, vb.pp("attn"))?,
            ln_2: layer_norm(n_embd, bias, vb.pp("ln_2"))?,
            mlp: Mlp::new(n_embd, bias, vb.pp("mlp"))?,
        })
    }

    pub(crate) fn forward(
        &mut self,
        x: &Tensor,
        mask: Option<&Tensor>,
        use_cache: bool,
    ) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?, mask, use_cache)?)?;
        &x + self.mlp.forward(&self.ln_2.forward(&x)?)?
    }

    /// Non-causal pass without touching the cache.
    pub(crate) fn forward_stateless(&self, x: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward_stateless(&self.ln_1.forward(x)?, None)?)?;
        &x + self.mlp.forward(&self.ln_2.forward(&x)?)?
    }

    fn clear_kv_cache(&mut self) {
        self.attn.clear_kv_cache();
    }
}

pub struct BarkGpt {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    block_size: usize,
    device: Device,
    dtype: DType,
}

impl BarkGpt {
    pub fn new(cfg: &GptConfig, vb: VarBuilder) -> Result<Self> {
        let vb_t = vb.pp("transformer");
        let blocks = (0..cfg.n_layer)
            .map(|i| Block::new(cfg.n_embd, cfg.n_head, cfg.bias, vb_t.pp("h").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            wte: embedding(cfg.input_vocab_size, cfg.n_embd, vb_t.pp("wte"))?,
            wpe: embedding(cfg.block_size, cfg.n_embd, vb_t.pp("wpe"))?,
            blocks,
            ln_f: layer_norm(cfg.n_embd, cfg.bias, vb_t.pp("ln_f"))?,
            lm_head: linear_no_bias(cfg.n_embd, cfg.output_vocab_size, vb.pp("lm_head"))?,
            block_size: cfg.block_size,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    fn embed(&self, ids: &Tensor, merge_context: bool) -> Result<Tensor> {
        let (_, t) = ids.dims2()?;
        if !merge_context {
            return self.wte.forward(ids);
        }
        if t <= 2 * MERGED_SEGMENT {
            candle_core::bail!(
                "merge_context needs more than {} input ids, got {t}",
                2 * MERGED_SEGMENT
            );
        }
        let text = self.wte.forward(&ids.narrow(1, 0, MERGED_SEGMENT)?)?;
        let history = self.wte.forward(&ids.narrow(1, MERGED_SEGMENT, MERGED_SEGMENT)?)?;
        let rest = self
            .wte
            .forward(&ids.narrow(1, 2 * MERGED_SEGMENT, t - 2 * MERGED_SEGMENT)?)?;
        Tensor::cat(&[&(text + history)?, &rest], 1)
    }
}

impl CausalLm for BarkGpt {
    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(
        &mut self,
        input_ids: &[u32],
        merge_context: bool,
        use_cache: bool,
    ) -> Result<Tensor> {
        let past_len = if use_cache {
            self.blocks.first().map_or(0, |b| b.attn.cached_len())
        } else {
            0
        };
        let ids = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        let tok_emb = self.embed(&ids, merge_context && past_len == 0)?;
        let seq_len = tok_emb.dim(1)?;
        if past_len + seq_len > self.block_size {
            candle_core::bail!(
                "sequence of {} positions exceeds block size {}",
                past_len + seq_len,
                self.block_size
            );
        }

        let positions =
            Tensor::arange(past_len as u32, (past_len + seq_len) as u32, &self.device)?
                .unsqueeze(0)?;
        let mut x = tok_emb.broadcast_add(&self.wpe.forward(&positions)?)?;

        let mask = if seq_len > 1 {
            Some(build_causal_mask_with_offset(seq_len, past_len, &self.device, self.dtype)?)
        } else {
            None
        };
        for block in self.blocks.iter_mut() {
            x = block.forward(&x, mask.as_ref(), use_cache)?;
        }

        let last = x.narrow(1, seq_len - 1, 1)?;
        let logits = self.lm_head.forward(&self.ln_f.forward(&last)?)?;
        logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)
    }

    fn clear_kv_cache(&mut self) {
        for block in self.blocks.iter_mut() {
            block.clear_kv_cache();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny() -> (BarkGpt, VarMap) {
        let cfg = GptConfig {
            block_size: 64,
            input_vocab_size: 40,
            output_vocab_size: 30,
            n_layer: 2,
            n_head: 2,
            n_embd: 8,
            bias: false,
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (BarkGpt::new(&cfg, vb).unwrap(), varmap)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn cached_decoding_matches_full_recompute() {
        let (mut model, _vars) = tiny();
        let ids: Vec<u32> = (0..12).map(|i| i % 40).collect();

        model.clear_kv_cache();
        model.forward(&ids[..8], false, true).unwrap();
        let mut cached = Tensor::zeros(30, DType::F32, &Device::Cpu).unwrap();
        for n in 8..12 {
            cached = model.forward(&ids[n..n + 1], false, true).unwrap();
        }
        let full = model.forward(&ids, false, false).unwrap();
        assert_eq!(cached.dims(), &[30]);
        assert!(max_abs_diff(&cached, &full) < 1e-4);
    }

    #[test]
    fn config_accepts_hf_aliases() {
        let cfg: GptConfig = serde_json::from_str(
            r#"{"block_size": 1024, "input_vocab_size": 129600, "output_vocab_size": 10048,
                "num_layers": 24, "num_heads": 16, "hidden_size": 1024}"#,
        )
        .unwrap();
        assert_eq!(cfg.n_layer, 24);
        assert_eq!(cfg.n_embd, 1024);
        assert!(cfg.bias);
    }
}
