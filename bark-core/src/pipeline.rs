//! End-to-end text → audio orchestration.
//!
//! Stages always run semantic → coarse → fine → decode. Every stage reads the
//! same optional [`HistoryPrompt`]; nothing is passed through shared state.

use std::path::Path;

use tracing::info;

use crate::audio::Waveform;
use crate::bundle::{
    self, CodebookTokens, HistoryPrompt, PartialBundle, SemanticTokens, VoiceBundle,
};
use crate::codec::CodecAdapter;
use crate::error::Result;
use crate::generation::coarse::{CoarseOptions, CoarseStage};
use crate::generation::fine::{FineOptions, FineStage};
use crate::generation::semantic::{SemanticOptions, SemanticStage, DEFAULT_MIN_EOS_P};

/// Temperature used by the fine stage unless overridden.
pub const DEFAULT_FINE_TEMPERATURE: f64 = 0.5;

/// Output of a waveform-producing call.
#[derive(Debug, Clone)]
pub struct GeneratedAudio {
    pub waveform: Waveform,
    /// The full generation, reusable as a voice, when it was requested.
    pub bundle: Option<VoiceBundle>,
}

/// All four sampling knobs of one generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub semantic_temp: f64,
    pub eos_p: f64,
    pub coarse_temp: f64,
    pub fine_temp: f64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            semantic_temp: 0.6,
            eos_p: DEFAULT_MIN_EOS_P,
            coarse_temp: 0.7,
            fine_temp: DEFAULT_FINE_TEMPERATURE,
        }
    }
}

pub struct GenerationPipeline {
    semantic: SemanticStage,
    coarse: CoarseStage,
    fine: FineStage,
    codec: CodecAdapter,
    seed: u64,
    fine_temperature: f64,
}

impl GenerationPipeline {
    pub fn new(
        semantic: SemanticStage,
        coarse: CoarseStage,
        fine: FineStage,
        codec: CodecAdapter,
    ) -> Self {
        Self {
            semantic,
            coarse,
            fine,
            codec,
            seed: 0,
            fine_temperature: DEFAULT_FINE_TEMPERATURE,
        }
    }

    /// Seed for the semantic stage; coarse uses `seed + 1`, fine `seed + 2`.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn with_fine_temperature(mut self, temperature: f64) -> Self {
        self.fine_temperature = temperature;
        self
    }

    pub fn fine_temperature(&self) -> f64 {
        self.fine_temperature
    }

    pub fn codec(&self) -> &CodecAdapter {
        &self.codec
    }

    pub fn semantic_stage(&mut self) -> &mut SemanticStage {
        &mut self.semantic
    }

    pub(crate) fn semantic_options(&self, temperature: f64, silent: bool) -> SemanticOptions {
        SemanticOptions {
            temperature,
            use_kv_caching: true,
            silent,
            seed: self.seed,
            ..Default::default()
        }
    }

    /// Text → semantic tokens with caching on and the default EOS threshold.
    pub fn text_to_semantic(
        &mut self,
        text: &str,
        history: Option<HistoryPrompt<'_>>,
        temperature: f64,
        silent: bool,
    ) -> Result<SemanticTokens> {
        let opts = self.semantic_options(temperature, silent);
        self.semantic.generate(text, history, &opts)
    }

    /// Semantic tokens → waveform. `temperature` drives the coarse stage; the
    /// fine stage keeps [`fine_temperature`](Self::fine_temperature).
    pub fn semantic_to_waveform(
        &mut self,
        semantic: &SemanticTokens,
        history: Option<HistoryPrompt<'_>>,
        temperature: f64,
        silent: bool,
        output_full: bool,
    ) -> Result<GeneratedAudio> {
        let fine_temp = self.fine_temperature;
        self.acoustic(semantic, history, temperature, fine_temp, silent, output_full)
    }

    /// Semantic → waveform, keeping the full generation alongside.
    pub(crate) fn semantic_to_bundle(
        &mut self,
        semantic: &SemanticTokens,
        history: Option<HistoryPrompt<'_>>,
        temperature: f64,
        silent: bool,
    ) -> Result<(Waveform, VoiceBundle)> {
        let fine_temp = self.fine_temperature;
        let (coarse, fine, waveform) =
            self.acoustic_tokens(semantic, history, temperature, fine_temp, silent)?;
        Ok((waveform, VoiceBundle::new(semantic.clone(), coarse, fine)?))
    }

    fn acoustic(
        &mut self,
        semantic: &SemanticTokens,
        history: Option<HistoryPrompt<'_>>,
        coarse_temp: f64,
        fine_temp: f64,
        silent: bool,
        output_full: bool,
    ) -> Result<GeneratedAudio> {
        let (coarse, fine, waveform) =
            self.acoustic_tokens(semantic, history, coarse_temp, fine_temp, silent)?;
        let bundle = if output_full {
            Some(VoiceBundle::new(semantic.clone(), coarse, fine)?)
        } else {
            None
        };
        Ok(GeneratedAudio { waveform, bundle })
    }

    fn acoustic_tokens(
        &mut self,
        semantic: &SemanticTokens,
        history: Option<HistoryPrompt<'_>>,
        coarse_temp: f64,
        fine_temp: f64,
        silent: bool,
    ) -> Result<(CodebookTokens, CodebookTokens, Waveform)> {
        let coarse_opts = CoarseOptions {
            temperature: coarse_temp,
            use_kv_caching: true,
            silent,
            seed: self.seed.wrapping_add(1),
            ..Default::default()
        };
        let coarse = self.coarse.generate(semantic, history, &coarse_opts)?;

        let fine_opts = FineOptions {
            temperature: Some(fine_temp),
            seed: self.seed.wrapping_add(2),
        };
        let fine = self.fine.generate(&coarse, history, &fine_opts)?;
        let waveform = self.codec.decode(&fine)?;
        Ok((coarse, fine, waveform))
    }

    /// Text → waveform. `text_temp` drives the semantic stage and
    /// `waveform_temp` the coarse stage.
    pub fn generate_audio(
        &mut self,
        text: &str,
        history: Option<HistoryPrompt<'_>>,
        text_temp: f64,
        waveform_temp: f64,
        silent: bool,
        output_full: bool,
    ) -> Result<GeneratedAudio> {
        let semantic = self.text_to_semantic(text, history, text_temp, silent)?;
        let out =
            self.semantic_to_waveform(&semantic, history, waveform_temp, silent, output_full)?;
        if !silent {
            info!(
                semantic = semantic.len(),
                samples = out.waveform.len(),
                seconds = out.waveform.duration_s(),
                "generated audio"
            );
        }
        Ok(out)
    }

    /// Text → waveform with every stage temperature and the EOS threshold set.
    pub fn generate_with_settings(
        &mut self,
        text: &str,
        settings: &GenerationSettings,
        voice: Option<HistoryPrompt<'_>>,
        output_full: bool,
    ) -> Result<GeneratedAudio> {
        let opts = SemanticOptions {
            min_eos_p: settings.eos_p,
            ..self.semantic_options(settings.semantic_temp, false)
        };
        let semantic = self.semantic.generate(text, voice, &opts)?;
        self.acoustic(
            &semantic,
            voice,
            settings.coarse_temp,
            settings.fine_temp,
            false,
            output_full,
        )
    }

    pub fn save_bundle<P: AsRef<Path>>(path: P, bundle: &VoiceBundle) -> Result<()> {
        bundle::save_bundle(path, bundle)
    }

    pub fn load_bundle<P: AsRef<Path>>(path: P) -> Result<VoiceBundle> {
        bundle::load_bundle(path)
    }

    pub fn load_history_prompt<P: AsRef<Path>>(path: P) -> Result<PartialBundle> {
        bundle::load_history_prompt(path)
    }
}
