use std::path::{Path, PathBuf};

use tracing::info;

use crate::audio::read_wav;
use crate::bundle::{VoiceBundle, BUNDLE_EXTENSION};
use crate::error::{BarkError, Result};
use crate::generation::{SemanticOptions, N_COARSE_CODEBOOKS};
use crate::pipeline::GenerationPipeline;
use crate::progress::{notify, ProgressReporter};

/// Builds a [`VoiceBundle`] from a recording and what is said in it.
pub struct VoiceCloner<'p> {
    pipeline: &'p mut GenerationPipeline,
}

impl<'p> VoiceCloner<'p> {
    pub fn new(pipeline: &'p mut GenerationPipeline) -> Self {
        Self { pipeline }
    }

    /// `<dest_name>.npz`, unless `dest_name` already carries the extension.
    pub fn bundle_path(dest_name: &str) -> PathBuf {
        let path = PathBuf::from(dest_name);
        match path.extension().and_then(|e| e.to_str()) {
            Some(BUNDLE_EXTENSION) => path,
            _ => PathBuf::from(format!("{dest_name}.{BUNDLE_EXTENSION}")),
        }
    }

    /// Encode the clip, generate semantic tokens for the transcript bounded by
    /// the clip duration, persist the bundle and return it.
    pub fn clone_voice<P: AsRef<Path>>(
        &mut self,
        audio_path: P,
        transcript: &str,
        dest_name: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<VoiceBundle> {
        let transcript = transcript.trim();
        if transcript.is_empty() {
            return Err(BarkError::Input("no transcription text entered".into()));
        }
        let audio_path = audio_path.as_ref();

        notify(progress, 0.0, "Loading codec");
        let codec = self.pipeline.codec();

        notify(progress, 0.25, "Converting WAV");
        let wav = codec.prepare(&read_wav(audio_path)?)?;

        notify(progress, 0.5, "Extracting codes");
        let fine = codec.encode(&wav)?;
        let coarse = fine.leading_rows(N_COARSE_CODEBOOKS)?;
        let seconds = wav.duration_s();

        notify(progress, 0.75, "Generating semantic tokens");
        let opts = SemanticOptions {
            temperature: 0.7,
            top_k: Some(50),
            top_p: Some(0.95),
            max_duration_s: Some(seconds),
            ..self.pipeline.semantic_options(0.7, false)
        };
        let semantic = self.pipeline.semantic_stage().generate(transcript, None, &opts)?;

        let bundle = VoiceBundle::new(semantic, coarse, fine)?;
        let dest = Self::bundle_path(dest_name);
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        bundle.save(&dest)?;
        info!(
            source = %audio_path.display(),
            dest = %dest.display(),
            seconds,
            semantic = bundle.semantic_prompt().len(),
            frames = bundle.fine_prompt().n_frames(),
            "cloned voice"
        );

        notify(progress, 1.0, "Finished");
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::SEMANTIC_RATE_HZ;
    use crate::test_utils::{mock_pipeline_stopping_after, write_test_wav};
    use std::sync::Mutex;

    #[test]
    fn three_second_clip_bounds_semantic_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("ref.wav");
        write_test_wav(&wav, 16_000, 3.0);
        let dest = dir.path().join("voices").join("me");

        let mut pipeline = mock_pipeline_stopping_after(None);
        let bundle = VoiceCloner::new(&mut pipeline)
            .clone_voice(&wav, "This is my voice.", dest.to_str().unwrap(), &crate::NoProgress)
            .unwrap();

        assert_eq!(bundle.semantic_prompt().len(), (3.0 * SEMANTIC_RATE_HZ).floor() as usize);
        assert_eq!(bundle.fine_prompt().n_codebooks(), 8);
        assert_eq!(bundle.coarse_prompt(), &bundle.fine_prompt().leading_rows(2).unwrap());

        let saved = VoiceBundle::load(dir.path().join("voices").join("me.npz")).unwrap();
        assert_eq!(saved, bundle);
    }

    #[test]
    fn empty_transcript_is_rejected_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nobody");
        let mut pipeline = mock_pipeline_stopping_after(None);
        let stats = Mutex::new(0usize);
        let counter = |_: f32, _: &str| -> anyhow::Result<()> {
            *stats.lock().unwrap() += 1;
            Ok(())
        };

        let err = VoiceCloner::new(&mut pipeline)
            .clone_voice(
                dir.path().join("missing.wav"),
                "   ",
                dest.to_str().unwrap(),
                &counter,
            )
            .unwrap_err();

        assert!(matches!(err, BarkError::Input(_)));
        assert_eq!(*stats.lock().unwrap(), 0);
        assert!(!dir.path().join("nobody.npz").exists());
    }

    #[test]
    fn milestones_are_reported_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("ref.wav");
        write_test_wav(&wav, 24_000, 0.5);
        let seen = Mutex::new(Vec::new());
        let recorder = |f: f32, d: &str| -> anyhow::Result<()> {
            seen.lock().unwrap().push((f, d.to_string()));
            Ok(())
        };

        let mut pipeline = mock_pipeline_stopping_after(Some(10));
        VoiceCloner::new(&mut pipeline)
            .clone_voice(&wav, "hi", dir.path().join("v").to_str().unwrap(), &recorder)
            .unwrap();

        let seen = seen.into_inner().unwrap();
        let fractions: Vec<f32> = seen.iter().map(|(f, _)| *f).collect();
        assert_eq!(fractions, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(seen[4].1, "Finished");
    }

    #[test]
    fn failing_progress_reporter_does_not_abort() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("ref.wav");
        write_test_wav(&wav, 24_000, 0.5);
        let failing = |_: f32, _: &str| -> anyhow::Result<()> { anyhow::bail!("window closed") };

        let mut pipeline = mock_pipeline_stopping_after(Some(10));
        let bundle = VoiceCloner::new(&mut pipeline)
            .clone_voice(&wav, "hi", dir.path().join("v").to_str().unwrap(), &failing)
            .unwrap();
        assert!(!bundle.semantic_prompt().is_empty());
    }

    #[test]
    fn bundle_path_appends_extension_once() {
        assert_eq!(VoiceCloner::bundle_path("voices/me"), PathBuf::from("voices/me.npz"));
        assert_eq!(VoiceCloner::bundle_path("me.npz"), PathBuf::from("me.npz"));
    }
}
