//! Candle implementations of the generation capabilities.
//!
//! A model directory holds `tokenizer.json` and one sub-directory per model,
//! each with a `config.json` and its safetensors weights:
//!
//! ```text
//! <model_dir>/
//!   tokenizer.json
//!   text/    coarse/    fine/    codec/
//! ```

pub mod encodec;
pub mod fine_gpt;
pub mod gpt;

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::codec::CodecAdapter;
use crate::error::{BarkError, Result};
use crate::generation::{CoarseStage, FineStage, SemanticStage};
use crate::pipeline::GenerationPipeline;

pub use self::encodec::EncodecCodec;
pub use fine_gpt::{FineGpt, FineGptConfig};
pub use gpt::{BarkGpt, GptConfig};

const TEXT_DIR: &str = "text";
const COARSE_DIR: &str = "coarse";
const FINE_DIR: &str = "fine";
const CODEC_DIR: &str = "codec";

fn read_config<T: DeserializeOwned>(dir: &Path) -> Result<T> {
    let path = dir.join("config.json");
    let data = std::fs::read(&path).map_err(|e| {
        BarkError::InvalidConfiguration(format!("cannot read {}: {e}", path.display()))
    })?;
    Ok(serde_json::from_slice(&data)?)
}

/// Weight files of a model directory: the shards named by
/// `model.safetensors.index.json`, else every `*.safetensors` file.
pub fn get_safetensors_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let index = dir.join("model.safetensors.index.json");
    if index.is_file() {
        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&index)?)?;
        let Some(weight_map) = json.get("weight_map").and_then(|m| m.as_object()) else {
            return Err(BarkError::InvalidConfiguration(format!(
                "{} has no weight_map",
                index.display()
            )));
        };
        let mut files: Vec<PathBuf> = weight_map
            .values()
            .filter_map(|v| v.as_str())
            .map(|f| dir.join(f))
            .collect();
        files.sort();
        files.dedup();
        return Ok(files);
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("safetensors"))
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(BarkError::InvalidConfiguration(format!(
            "no safetensors weights in {}",
            dir.display()
        )));
    }
    Ok(files)
}

fn var_builder(dir: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let files = get_safetensors_files(dir)?;
    Ok(unsafe { VarBuilder::from_mmaped_safetensors(&files, dtype, device) }?)
}

/// Load the full pipeline from a converted model directory.
pub fn load_pipeline<P: AsRef<Path>>(
    model_dir: P,
    device: &Device,
    dtype: DType,
) -> Result<GenerationPipeline> {
    let model_dir = model_dir.as_ref();
    let start = std::time::Instant::now();

    let tokenizer_path = model_dir.join("tokenizer.json");
    let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path).map_err(|e| {
        BarkError::Tokenizer(format!("failed to load {}: {e}", tokenizer_path.display()))
    })?;

    let text_dir = model_dir.join(TEXT_DIR);
    let text_cfg: GptConfig = read_config(&text_dir)?;
    let text = BarkGpt::new(&text_cfg, var_builder(&text_dir, dtype, device)?)?;

    let coarse_dir = model_dir.join(COARSE_DIR);
    let coarse_cfg: GptConfig = read_config(&coarse_dir)?;
    let coarse = BarkGpt::new(&coarse_cfg, var_builder(&coarse_dir, dtype, device)?)?;

    let fine_dir = model_dir.join(FINE_DIR);
    let fine_cfg: FineGptConfig = read_config(&fine_dir)?;
    let fine = FineGpt::new(&fine_cfg, var_builder(&fine_dir, dtype, device)?)?;

    // The codec runs in f32 regardless of the transformer dtype.
    let codec_dir = model_dir.join(CODEC_DIR);
    let codec_cfg: candle_transformers::models::encodec::Config = read_config(&codec_dir)?;
    let codec = EncodecCodec::new(
        &codec_cfg,
        fine_cfg.n_codes_total,
        var_builder(&codec_dir, DType::F32, device)?,
    )?;

    info!(
        model_dir = %model_dir.display(),
        device = ?device,
        dtype = ?dtype,
        elapsed = ?start.elapsed(),
        "loaded models"
    );
    Ok(GenerationPipeline::new(
        SemanticStage::new(Box::new(text), Box::new(tokenizer)),
        CoarseStage::new(Box::new(coarse)),
        FineStage::new(Box::new(fine)),
        CodecAdapter::new(Box::new(codec)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safetensors_index_lists_each_shard_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("model.safetensors.index.json"),
            r#"{"weight_map": {"a": "model-00002.safetensors", "b": "model-00001.safetensors",
                "c": "model-00001.safetensors"}}"#,
        )
        .unwrap();
        let files = get_safetensors_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![
                dir.path().join("model-00001.safetensors"),
                dir.path().join("model-00002.safetensors")
            ]
        );
    }

    #[test]
    fn empty_model_dir_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            get_safetensors_files(dir.path()),
            Err(BarkError::InvalidConfiguration(_))
        ));
        assert!(load_pipeline(dir.path(), &Device::Cpu, DType::F32).is_err());
    }
}
