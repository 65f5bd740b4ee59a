//! EnCodec behind the [`AudioCodec`] capability.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::encodec;

use crate::generation::AudioCodec;

pub struct EncodecCodec {
    model: encodec::Model,
    sample_rate: u32,
    channels: usize,
    n_codebooks: usize,
    hop_length: usize,
    device: Device,
}

impl EncodecCodec {
    /// Build the codec with the bandwidth that yields `n_codebooks` quantizers.
    pub fn new(cfg: &encodec::Config, n_codebooks: usize, vb: VarBuilder) -> Result<Self> {
        let hop_length: usize = cfg.upsampling_ratios.iter().product();
        if hop_length == 0 {
            candle_core::bail!("codec upsampling ratios must be positive");
        }
        let frame_rate = cfg.sampling_rate.div_ceil(hop_length);
        let mut cfg = cfg.clone();
        cfg.target_bandwidths = vec![(n_codebooks * frame_rate * 10) as f64 / 1000.0];
        let device = vb.device().clone();
        Ok(Self {
            model: encodec::Model::new(&cfg, vb)?,
            sample_rate: cfg.sampling_rate as u32,
            channels: cfg.audio_channels,
            n_codebooks,
            hop_length,
            device,
        })
    }
}

impl AudioCodec for EncodecCodec {
    fn device(&self) -> &Device {
        &self.device
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn n_codebooks(&self) -> usize {
        self.n_codebooks
    }

    fn hop_length(&self) -> usize {
        self.hop_length
    }

    fn encode(&self, wav: &Tensor) -> Result<Tensor> {
        self.model.encode(&wav.to_dtype(DType::F32)?)?.to_dtype(DType::U32)
    }

    fn decode(&self, codes: &Tensor) -> Result<Tensor> {
        self.model.decode(&codes.to_dtype(DType::U32)?)?.to_dtype(DType::F32)
    }
}
