use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::audio::{read_wav, Waveform};
use crate::bundle::{SemanticTokens, VoiceBundle};
use crate::error::{BarkError, Result};
use crate::generation::{COARSE_RATE_HZ, SEMANTIC_RATE_HZ};
use crate::pipeline::GenerationPipeline;
use crate::progress::{notify, ProgressReporter};

const SWAP_TEMPERATURE: f64 = 0.7;

/// Maps a waveform to semantic tokens that describe what is said in it,
/// independently of who says it (HuBERT-style quantized features).
pub trait ContentTokenizer: Send {
    /// `wav` is already in the codec's native rate and channel layout.
    fn tokenize(&mut self, wav: &Waveform) -> Result<SemanticTokens>;
}

/// One re-voiced rendition, reproducible from its seed.
#[derive(Debug, Clone)]
pub struct SwapCandidate {
    pub seed: u64,
    pub bundle: VoiceBundle,
    pub waveform: Waveform,
}

pub struct VoiceSwapper<'p> {
    pipeline: &'p mut GenerationPipeline,
    content: Box<dyn ContentTokenizer>,
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl<'p> VoiceSwapper<'p> {
    pub fn new(pipeline: &'p mut GenerationPipeline, content: Box<dyn ContentTokenizer>) -> Self {
        Self { pipeline, content }
    }

    /// Re-voice the recording at `audio_path` with `target`, producing
    /// `batch_count` candidates seeded `seed, seed + 1, ...`.
    pub fn swap_voice<P: AsRef<Path>>(
        &mut self,
        audio_path: P,
        target: &VoiceBundle,
        seed: Option<u64>,
        batch_count: usize,
        progress: &dyn ProgressReporter,
    ) -> Result<Vec<SwapCandidate>> {
        if batch_count == 0 {
            return Err(BarkError::Input("batch count must be at least 1".into()));
        }
        let audio_path = audio_path.as_ref();
        let seed = seed.unwrap_or_else(clock_seed);

        notify(progress, 0.0, "Loading audio");
        let wav = self.pipeline.codec().prepare(&read_wav(audio_path)?)?;

        notify(progress, 0.1, "Measuring reference");
        let frames = self.pipeline.codec().frames_for(wav.len());
        let max_tokens = (frames as f64 / COARSE_RATE_HZ * SEMANTIC_RATE_HZ).floor() as usize;

        notify(progress, 0.2, "Extracting content tokens");
        let content = self.content.tokenize(&wav)?.truncated(max_tokens);
        if content.is_empty() {
            return Err(BarkError::Input(format!(
                "no speech content found in {}",
                audio_path.display()
            )));
        }
        debug!(frames, tokens = content.len(), max_tokens, "content tokens");

        let previous_seed = self.pipeline.seed();
        let result = self.generate_candidates(&content, target, seed, batch_count, progress);
        self.pipeline.set_seed(previous_seed);
        let candidates = result?;

        info!(
            source = %audio_path.display(),
            seed,
            candidates = candidates.len(),
            "swapped voice"
        );
        notify(progress, 1.0, "Finished");
        Ok(candidates)
    }

    fn generate_candidates(
        &mut self,
        content: &SemanticTokens,
        target: &VoiceBundle,
        seed: u64,
        batch_count: usize,
        progress: &dyn ProgressReporter,
    ) -> Result<Vec<SwapCandidate>> {
        let mut candidates = Vec::with_capacity(batch_count);
        for i in 0..batch_count {
            let candidate_seed = seed.wrapping_add(i as u64);
            notify(
                progress,
                0.2 + 0.8 * i as f32 / batch_count as f32,
                &format!("Generating candidate {}/{batch_count}", i + 1),
            );
            self.pipeline.set_seed(candidate_seed);
            let (waveform, bundle) = self.pipeline.semantic_to_bundle(
                content,
                Some(target.as_history()),
                SWAP_TEMPERATURE,
                true,
            )?;
            candidates.push(SwapCandidate {
                seed: candidate_seed,
                bundle,
                waveform,
            });
        }
        Ok(candidates)
    }
}
