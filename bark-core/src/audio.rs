//! Waveform container, WAV I/O and sample-rate / channel conversion.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::error::{BarkError, Result};

/// Planar f32 audio in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl Waveform {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Result<Self> {
        if sample_rate == 0 {
            return Err(BarkError::Audio("sample rate must be positive".into()));
        }
        if channels.is_empty() {
            return Err(BarkError::Audio("waveform needs at least one channel".into()));
        }
        let len = channels[0].len();
        if channels.iter().any(|c| c.len() != len) {
            return Err(BarkError::Audio("channel length mismatch".into()));
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }

    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Result<Self> {
        Self::new(sample_rate, vec![samples])
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.channels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn duration_s(&self) -> f64 {
        self.len() as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, idx: usize) -> &[f32] {
        &self.channels[idx]
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    pub fn into_channels(self) -> Vec<Vec<f32>> {
        self.channels
    }

    /// `[1, channels, samples]` f32.
    pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        let data = self.channels.concat();
        Tensor::from_vec(data, (1, self.n_channels(), self.len()), device)
    }

    /// Accepts `[1, channels, samples]`, `[channels, samples]` or `[samples]`.
    pub fn from_tensor(audio: &Tensor, sample_rate: u32) -> Result<Self> {
        let audio = audio.to_dtype(DType::F32)?;
        let audio = match audio.rank() {
            1 => audio.unsqueeze(0)?,
            2 => audio,
            3 => audio.squeeze(0)?,
            r => {
                return Err(BarkError::Audio(format!(
                    "expected a waveform tensor of rank 1-3, got rank {r}"
                )))
            }
        };
        Self::new(sample_rate, audio.to_vec2::<f32>()?)
    }
}

/// Read a WAV file into planar f32. Integer formats are scaled to [-1, 1].
pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<Waveform> {
    let path = path.as_ref();
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let n_channels = spec.channels as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    let mut channels = vec![Vec::with_capacity(interleaved.len() / n_channels.max(1)); n_channels];
    for frame in interleaved.chunks_exact(n_channels) {
        for (c, &s) in frame.iter().enumerate() {
            channels[c].push(s);
        }
    }
    tracing::debug!(
        path = %path.display(),
        sample_rate = spec.sample_rate,
        channels = n_channels,
        bits = spec.bits_per_sample,
        "read wav"
    );
    Waveform::new(spec.sample_rate, channels)
}

/// Write 16-bit PCM.
pub fn write_wav<P: AsRef<Path>>(path: P, wav: &Waveform) -> Result<()> {
    let spec = WavSpec {
        channels: wav.n_channels() as u16,
        sample_rate: wav.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for t in 0..wav.len() {
        for channel in &wav.channels {
            let sample = (channel[t] * 32767.0).round().clamp(-32768.0, 32767.0);
            writer.write_sample(sample as i16)?;
        }
    }
    writer.finalize()?;
    Ok(())
}

/// Remix to `to_channels` then resample to `to_rate`.
pub fn convert_audio(wav: &Waveform, to_rate: u32, to_channels: usize) -> Result<Waveform> {
    let channels = remix(wav.channels.clone(), to_channels)?;
    if wav.sample_rate == to_rate || wav.is_empty() {
        return Waveform::new(to_rate, channels);
    }
    let resampled = resample(channels, wav.sample_rate, to_rate)?;
    Waveform::new(to_rate, resampled)
}

/// Mean to mono, or duplicate mono to many channels.
pub fn remix(samples: Vec<Vec<f32>>, to_channels: usize) -> Result<Vec<Vec<f32>>> {
    let from_channels = samples.len();
    if from_channels == to_channels {
        return Ok(samples);
    }
    if to_channels == 1 {
        let len = samples[0].len();
        let mut mixed = vec![0.0_f32; len];
        for channel in &samples {
            for (acc, value) in mixed.iter_mut().zip(channel) {
                *acc += *value;
            }
        }
        let scale = 1.0 / from_channels as f32;
        mixed.iter_mut().for_each(|v| *v *= scale);
        return Ok(vec![mixed]);
    }
    if from_channels == 1 && to_channels > 1 {
        return Ok(vec![samples[0].clone(); to_channels]);
    }
    Err(BarkError::Audio(format!(
        "unsupported channel conversion from {from_channels} to {to_channels}"
    )))
}

fn resample(samples: Vec<Vec<f32>>, from_rate: u32, to_rate: u32) -> Result<Vec<Vec<f32>>> {
    let channels = samples.len();
    let input_len = samples[0].len();
    let ratio = to_rate as f64 / from_rate as f64;
    let expected = (input_len as f64 * ratio).round() as usize;

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let audio_err = |e: &dyn std::fmt::Display| BarkError::Audio(format!("resampling failed: {e}"));
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, input_len, channels)
        .map_err(|e| audio_err(&e))?;
    let delay = resampler.output_delay();

    let mut output = resampler.process(&samples, None).map_err(|e| audio_err(&e))?;
    // Flush the filter tail so the delayed samples come out.
    let tail = resampler
        .process_partial(None::<&[Vec<f32>]>, None)
        .map_err(|e| audio_err(&e))?;
    for (out, rest) in output.iter_mut().zip(tail) {
        out.extend(rest);
        out.drain(..delay.min(out.len()));
        out.resize(expected, 0.0);
    }
    Ok(output)
}
