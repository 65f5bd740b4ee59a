//! Adapter between token arrays and waveforms around an [`AudioCodec`].

use tracing::debug;

use crate::audio::{convert_audio, Waveform};
use crate::bundle::CodebookTokens;
use crate::error::{BarkError, Result};
use crate::generation::AudioCodec;

pub struct CodecAdapter {
    codec: Box<dyn AudioCodec>,
}

impl CodecAdapter {
    pub fn new(codec: Box<dyn AudioCodec>) -> Self {
        Self { codec }
    }

    pub fn sample_rate(&self) -> u32 {
        self.codec.sample_rate()
    }

    pub fn n_codebooks(&self) -> usize {
        self.codec.n_codebooks()
    }

    pub fn hop_length(&self) -> usize {
        self.codec.hop_length()
    }

    /// Frames produced by encoding `n_samples` at the codec rate.
    pub fn frames_for(&self, n_samples: usize) -> usize {
        n_samples.div_ceil(self.codec.hop_length())
    }

    /// Remix and resample to the codec's native format.
    pub fn prepare(&self, wav: &Waveform) -> Result<Waveform> {
        convert_audio(wav, self.codec.sample_rate(), self.codec.channels())
    }

    /// Quantize a waveform of any rate or channel count.
    pub fn encode(&self, wav: &Waveform) -> Result<CodebookTokens> {
        let prepared = self.prepare(wav)?;
        if prepared.is_empty() {
            return CodebookTokens::new(self.codec.n_codebooks(), 0, Vec::new());
        }
        let input = prepared.to_tensor(self.codec.device())?;
        let codes = CodebookTokens::from_tensor(&self.codec.encode(&input)?)?;
        debug!(
            samples = prepared.len(),
            codebooks = codes.n_codebooks(),
            frames = codes.n_frames(),
            "encoded waveform"
        );
        Ok(codes)
    }

    /// Decode `[n_codebooks, T]` tokens to audio at the codec rate.
    pub fn decode(&self, tokens: &CodebookTokens) -> Result<Waveform> {
        if tokens.n_codebooks() != self.codec.n_codebooks() {
            return Err(BarkError::InvalidConfiguration(format!(
                "codec expects {} codebooks, got {}",
                self.codec.n_codebooks(),
                tokens.n_codebooks()
            )));
        }
        let sample_rate = self.codec.sample_rate();
        if tokens.is_empty() {
            return Waveform::new(sample_rate, vec![Vec::new(); self.codec.channels()]);
        }
        let codes = tokens.to_tensor(self.codec.device())?.unsqueeze(0)?;
        let audio = self.codec.decode(&codes)?;
        let wav = Waveform::from_tensor(&audio, sample_rate)?;
        debug!(frames = tokens.n_frames(), samples = wav.len(), "decoded tokens");
        Ok(wav)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockCodec;

    #[test]
    fn decode_length_is_frames_times_hop() {
        let adapter = CodecAdapter::new(Box::new(MockCodec::default()));
        let tokens = CodebookTokens::new(8, 12, vec![100; 96]).unwrap();
        let wav = adapter.decode(&tokens).unwrap();
        assert_eq!(wav.sample_rate(), 24_000);
        assert_eq!(wav.len(), 12 * adapter.hop_length());
    }

    #[test]
    fn zero_frames_decode_to_empty_audio() {
        let codec = MockCodec::default();
        let stats = codec.stats();
        let adapter = CodecAdapter::new(Box::new(codec));
        let tokens = CodebookTokens::new(8, 0, Vec::new()).unwrap();
        let wav = adapter.decode(&tokens).unwrap();
        assert!(wav.is_empty());
        assert_eq!(stats.decode_calls(), 0);
    }

    #[test]
    fn wrong_depth_is_rejected() {
        let adapter = CodecAdapter::new(Box::new(MockCodec::default()));
        let tokens = CodebookTokens::new(2, 4, vec![0; 8]).unwrap();
        let err = adapter.decode(&tokens).unwrap_err();
        assert!(matches!(err, BarkError::InvalidConfiguration(_)));
    }

    #[test]
    fn encode_resamples_and_remixes_first() {
        let codec = MockCodec::default();
        let stats = codec.stats();
        let adapter = CodecAdapter::new(Box::new(codec));
        let stereo = Waveform::new(48_000, vec![vec![0.2; 9_600], vec![0.0; 9_600]]).unwrap();
        let codes = adapter.encode(&stereo).unwrap();
        assert_eq!(codes.n_codebooks(), 8);
        // 0.2 s at 24 kHz with a 320-sample hop.
        assert_eq!(codes.n_frames(), 15);
        assert_eq!(adapter.frames_for(4_800), codes.n_frames());
        assert_eq!(stats.encode_calls(), 1);
    }

    #[test]
    fn empty_audio_encodes_without_calling_the_codec() {
        let codec = MockCodec::default();
        let stats = codec.stats();
        let adapter = CodecAdapter::new(Box::new(codec));
        let codes = adapter.encode(&Waveform::mono(24_000, Vec::new()).unwrap()).unwrap();
        assert_eq!(codes.n_frames(), 0);
        assert_eq!(stats.encode_calls(), 0);
    }
}
