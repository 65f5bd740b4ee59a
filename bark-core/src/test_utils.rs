//! Deterministic stand-ins for the model capabilities.

use std::path::Path;
use std::sync::{Arc, Mutex};

use candle_core::{Device, Result, Tensor};

use crate::audio::{write_wav, Waveform};
use crate::bundle::SemanticTokens;
use crate::cloning::ContentTokenizer;
use crate::codec::CodecAdapter;
use crate::generation::{
    AudioCodec, CausalLm, CoarseStage, FineLm, FineStage, SemanticStage, TextEncoder,
    CODEBOOK_SIZE, SEMANTIC_PAD_TOKEN, SEMANTIC_VOCAB_SIZE,
};
use crate::pipeline::GenerationPipeline;

fn fnv(ids: impl IntoIterator<Item = u32>) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for id in ids {
        h ^= id as u64;
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}

fn mix(h: u64, i: u64) -> f32 {
    let mut z = h ^ i.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    (z % 4096) as f32 / 1024.0
}

#[derive(Default)]
struct CausalStats {
    input_lens: Vec<usize>,
    first_input: Option<Vec<u32>>,
}

/// Shared view of the inputs a [`MockCausalLm`] has seen.
#[derive(Clone, Default)]
pub struct MockCausalLmStats(Arc<Mutex<CausalStats>>);

impl MockCausalLmStats {
    pub fn calls(&self) -> usize {
        self.0.lock().unwrap().input_lens.len()
    }

    pub fn first_input(&self) -> Option<Vec<u32>> {
        self.0.lock().unwrap().first_input.clone()
    }

    pub fn max_input_len_after_first(&self) -> Option<usize> {
        self.0.lock().unwrap().input_lens.iter().skip(1).max().copied()
    }
}

/// Logits are a pure function of the full context, so a model that keeps its
/// own context when caching must agree with one that is re-fed everything.
pub struct MockCausalLm {
    vocab: usize,
    device: Device,
    context: Vec<u32>,
    eos: Option<(usize, f32)>,
    stop_after: Option<(usize, usize)>,
    base_len: Option<usize>,
    stats: MockCausalLmStats,
}

impl MockCausalLm {
    pub fn new(vocab: usize) -> Self {
        Self {
            vocab,
            device: Device::Cpu,
            context: Vec::new(),
            eos: None,
            stop_after: None,
            base_len: None,
            stats: MockCausalLmStats::default(),
        }
    }

    /// Pin the logit at `idx`.
    pub fn with_eos(mut self, idx: usize, logit: f32) -> Self {
        self.eos = Some((idx, logit));
        self
    }

    /// Make `idx` overwhelmingly likely once `n` tokens follow the first input.
    pub fn with_stop_after(mut self, idx: usize, n: usize) -> Self {
        self.stop_after = Some((idx, n));
        self
    }

    pub fn stats(&self) -> MockCausalLmStats {
        self.stats.clone()
    }
}

impl CausalLm for MockCausalLm {
    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(
        &mut self,
        input_ids: &[u32],
        _merge_context: bool,
        use_cache: bool,
    ) -> Result<Tensor> {
        {
            let mut stats = self.stats.0.lock().unwrap();
            stats.input_lens.push(input_ids.len());
            if stats.first_input.is_none() {
                stats.first_input = Some(input_ids.to_vec());
            }
        }
        let context: &[u32] = if use_cache {
            self.context.extend_from_slice(input_ids);
            &self.context
        } else {
            input_ids
        };
        let base = *self.base_len.get_or_insert(context.len());

        let h = fnv(context.iter().copied());
        let mut logits: Vec<f32> = (0..self.vocab as u64).map(|i| mix(h, i)).collect();
        if let Some((idx, logit)) = self.eos {
            logits[idx] = logit;
        }
        if let Some((idx, n)) = self.stop_after {
            if context.len() >= base + n {
                logits[idx] = 100.0;
            }
        }
        Tensor::from_vec(logits, self.vocab, &self.device)
    }

    fn clear_kv_cache(&mut self) {
        self.context.clear();
        self.base_len = None;
    }
}

/// Fine model whose logits depend on the lower codebooks of each frame.
pub struct MockFineLm {
    n_total: usize,
    n_given: usize,
    device: Device,
}

impl MockFineLm {
    pub fn new(n_total: usize, n_given: usize) -> Self {
        Self {
            n_total,
            n_given,
            device: Device::Cpu,
        }
    }
}

impl FineLm for MockFineLm {
    fn device(&self) -> &Device {
        &self.device
    }

    fn n_codes_total(&self) -> usize {
        self.n_total
    }

    fn n_codes_given(&self) -> usize {
        self.n_given
    }

    fn forward(&self, pred_idx: usize, codes: &Tensor) -> Result<Tensor> {
        let (_, t, n) = codes.dims3()?;
        let rows = codes.squeeze(0)?.to_vec2::<u32>()?;
        let vocab = CODEBOOK_SIZE + 32;
        let mut logits = Vec::with_capacity(t * vocab);
        for row in &rows {
            let h = fnv(row[..pred_idx.min(n)].iter().copied().chain([pred_idx as u32]));
            logits.extend((0..vocab as u64).map(|i| mix(h, i)));
        }
        Tensor::from_vec(logits, (1, t, vocab), &self.device)
    }
}

#[derive(Default)]
struct CodecStats {
    encode_calls: usize,
    decode_calls: usize,
}

#[derive(Clone, Default)]
pub struct MockCodecStats(Arc<Mutex<CodecStats>>);

impl MockCodecStats {
    pub fn encode_calls(&self) -> usize {
        self.0.lock().unwrap().encode_calls
    }

    pub fn decode_calls(&self) -> usize {
        self.0.lock().unwrap().decode_calls
    }
}

/// 24 kHz mono, 8 codebooks, 320-sample hop.
pub struct MockCodec {
    device: Device,
    stats: MockCodecStats,
}

impl Default for MockCodec {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            stats: MockCodecStats::default(),
        }
    }
}

impl MockCodec {
    pub const HOP: usize = 320;

    pub fn stats(&self) -> MockCodecStats {
        self.stats.clone()
    }
}

impl AudioCodec for MockCodec {
    fn device(&self) -> &Device {
        &self.device
    }

    fn sample_rate(&self) -> u32 {
        24_000
    }

    fn channels(&self) -> usize {
        1
    }

    fn n_codebooks(&self) -> usize {
        8
    }

    fn hop_length(&self) -> usize {
        Self::HOP
    }

    fn encode(&self, wav: &Tensor) -> Result<Tensor> {
        self.stats.0.lock().unwrap().encode_calls += 1;
        let samples = wav.flatten_all()?.to_vec1::<f32>()?;
        let frames: Vec<f32> = samples
            .chunks(Self::HOP)
            .map(|c| c.iter().sum::<f32>() / c.len() as f32)
            .collect();
        let n_frames = frames.len();
        let mut codes = Vec::with_capacity(8 * n_frames);
        for q in 0..8u32 {
            codes.extend(frames.iter().map(|m| {
                let level = ((m.clamp(-1.0, 1.0) + 1.0) * 511.5) as u32;
                (level + q * 97) % CODEBOOK_SIZE as u32
            }));
        }
        Tensor::from_vec(codes, (1, 8, n_frames), &self.device)
    }

    fn decode(&self, codes: &Tensor) -> Result<Tensor> {
        self.stats.0.lock().unwrap().decode_calls += 1;
        let rows = codes.squeeze(0)?.to_vec2::<u32>()?;
        let n_frames = rows.first().map_or(0, Vec::len);
        let mut samples = Vec::with_capacity(n_frames * Self::HOP);
        for t in 0..n_frames {
            let value = rows[0][t] as f32 / 1023.0 - 0.5;
            samples.extend(std::iter::repeat(value).take(Self::HOP));
        }
        Tensor::from_vec(samples, (1, 1, n_frames * Self::HOP), &self.device)
    }
}

/// One token per byte.
pub struct ByteTokenizer;

impl TextEncoder for ByteTokenizer {
    fn encode(&self, text: &str) -> crate::Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }
}

/// Emits one semantic id per 200 samples, derived from the audio.
pub struct MockContentTokenizer;

impl ContentTokenizer for MockContentTokenizer {
    fn tokenize(&mut self, wav: &Waveform) -> crate::Result<SemanticTokens> {
        let ids = wav
            .channel(0)
            .chunks_exact(200)
            .map(|c| ((c[0].abs() * 9_999.0) as u32) % SEMANTIC_VOCAB_SIZE as u32)
            .collect();
        Ok(SemanticTokens::new(ids))
    }
}

/// Pipeline over the mocks; the semantic model ends after `semantic_len`
/// tokens when given.
pub fn mock_pipeline_stopping_after(semantic_len: Option<usize>) -> GenerationPipeline {
    mock_pipeline_with_codec(semantic_len, MockCodec::default())
}

fn mock_pipeline_with_codec(semantic_len: Option<usize>, codec: MockCodec) -> GenerationPipeline {
    let mut semantic = MockCausalLm::new(10_048).with_eos(SEMANTIC_PAD_TOKEN as usize, -100.0);
    if let Some(n) = semantic_len {
        semantic = semantic.with_stop_after(SEMANTIC_PAD_TOKEN as usize, n);
    }
    GenerationPipeline::new(
        SemanticStage::new(Box::new(semantic), Box::new(ByteTokenizer)),
        CoarseStage::new(Box::new(MockCausalLm::new(12_096))),
        FineStage::new(Box::new(MockFineLm::new(8, 1))),
        CodecAdapter::new(Box::new(codec)),
    )
}

pub fn mock_pipeline() -> GenerationPipeline {
    mock_pipeline_stopping_after(Some(40))
}

pub fn mock_pipeline_with_codec_stats() -> (GenerationPipeline, MockCodecStats) {
    let codec = MockCodec::default();
    let stats = codec.stats();
    (mock_pipeline_with_codec(Some(40), codec), stats)
}

/// Write a mono 16-bit sine clip.
pub fn write_test_wav(path: &Path, sample_rate: u32, seconds: f64) {
    let n = (sample_rate as f64 * seconds) as usize;
    let samples = (0..n)
        .map(|i| (i as f32 * 220.0 * 2.0 * std::f32::consts::PI / sample_rate as f32).sin() * 0.4)
        .collect();
    write_wav(path, &Waveform::mono(sample_rate, samples).unwrap()).unwrap();
}
