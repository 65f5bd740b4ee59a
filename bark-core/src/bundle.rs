//! Token containers and the persisted voice bundle.
//!
//! A [`VoiceBundle`] is the "full generation" artifact: three aligned token
//! arrays that any stage can consume as conditioning. Conditioning itself goes
//! through the borrowed [`HistoryPrompt`] view, which may carry any subset of
//! the three arrays.
//!
//! Bundles are stored as numpy `.npz` archives holding `semantic_prompt`
//! (1-D), `coarse_prompt` (`2 × T`) and `fine_prompt` (`n × T`) as int64
//! arrays, so prompts produced by the Python tooling load unchanged.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::error::{BarkError, Result};
use crate::generation::{CODEBOOK_SIZE, N_COARSE_CODEBOOKS, SEMANTIC_VOCAB_SIZE};

/// File extension required for persisted bundles.
pub const BUNDLE_EXTENSION: &str = "npz";

const SEMANTIC_KEY: &str = "semantic_prompt";
const COARSE_KEY: &str = "coarse_prompt";
const FINE_KEY: &str = "fine_prompt";

// ── Token containers ────────────────────────────────────────────────────

/// 1-D sequence of semantic token ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SemanticTokens(Vec<u32>);

impl SemanticTokens {
    pub fn new(ids: Vec<u32>) -> Self {
        Self(ids)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<u32> {
        self.0
    }

    /// Keep at most the first `n` tokens.
    pub fn truncated(mut self, n: usize) -> Self {
        self.0.truncate(n);
        self
    }

    fn validate(&self) -> Result<()> {
        if let Some(bad) = self.0.iter().find(|&&id| id as usize >= SEMANTIC_VOCAB_SIZE) {
            return Err(BarkError::Format(format!(
                "{SEMANTIC_KEY} contains id {bad}, expected ids below {SEMANTIC_VOCAB_SIZE}"
            )));
        }
        Ok(())
    }
}

impl From<Vec<u32>> for SemanticTokens {
    fn from(ids: Vec<u32>) -> Self {
        Self(ids)
    }
}

/// 2-D `[n_codebooks, n_frames]` array of acoustic token ids, row-major.
///
/// Coarse tokens use two rows; fine tokens carry the full codec depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodebookTokens {
    n_codebooks: usize,
    n_frames: usize,
    data: Vec<u32>,
}

impl CodebookTokens {
    pub fn new(n_codebooks: usize, n_frames: usize, data: Vec<u32>) -> Result<Self> {
        if n_codebooks == 0 {
            return Err(BarkError::Format("codebook array needs at least one row".into()));
        }
        if data.len() != n_codebooks * n_frames {
            return Err(BarkError::Format(format!(
                "codebook array of shape [{n_codebooks}, {n_frames}] cannot hold {} ids",
                data.len()
            )));
        }
        Ok(Self {
            n_codebooks,
            n_frames,
            data,
        })
    }

    /// Build from one `Vec` per codebook; every row must have the same length.
    pub fn from_rows(rows: Vec<Vec<u32>>) -> Result<Self> {
        let n_codebooks = rows.len();
        let n_frames = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != n_frames) {
            return Err(BarkError::Format("codebook rows have different lengths".into()));
        }
        Self::new(n_codebooks, n_frames, rows.concat())
    }

    pub fn n_codebooks(&self) -> usize {
        self.n_codebooks
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn is_empty(&self) -> bool {
        self.n_frames == 0
    }

    pub fn row(&self, codebook: usize) -> &[u32] {
        &self.data[codebook * self.n_frames..(codebook + 1) * self.n_frames]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u32]> + '_ {
        (0..self.n_codebooks).map(move |i| self.row(i))
    }

    pub fn get(&self, codebook: usize, frame: usize) -> u32 {
        self.data[codebook * self.n_frames + frame]
    }

    /// One id per codebook at `frame`.
    pub fn frame(&self, frame: usize) -> Vec<u32> {
        (0..self.n_codebooks).map(|c| self.get(c, frame)).collect()
    }

    /// The first `n` codebook rows, e.g. the coarse approximation of a fine array.
    pub fn leading_rows(&self, n: usize) -> Result<Self> {
        if n == 0 || n > self.n_codebooks {
            return Err(BarkError::InvalidConfiguration(format!(
                "cannot take {n} rows from a {}-row codebook array",
                self.n_codebooks
            )));
        }
        Self::new(n, self.n_frames, self.data[..n * self.n_frames].to_vec())
    }

    /// The trailing `n` frames (all of them if fewer are available).
    pub fn last_frames(&self, n: usize) -> Self {
        let start = self.n_frames.saturating_sub(n);
        let rows: Vec<u32> = self.rows().flat_map(|r| r[start..].iter().copied()).collect();
        Self {
            n_codebooks: self.n_codebooks,
            n_frames: self.n_frames - start,
            data: rows,
        }
    }

    pub fn max_id(&self) -> Option<u32> {
        self.data.iter().copied().max()
    }

    /// `[n_codebooks, n_frames]` u32 tensor.
    pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_vec(self.data.clone(), (self.n_codebooks, self.n_frames), device)
    }

    /// Accepts `[n_codebooks, n_frames]` or `[1, n_codebooks, n_frames]` integer tensors.
    pub fn from_tensor(codes: &Tensor) -> Result<Self> {
        let codes = if codes.rank() == 3 {
            codes.squeeze(0)?
        } else {
            codes.clone()
        };
        let (n_codebooks, n_frames) = codes.dims2()?;
        let data = codes
            .to_dtype(DType::U32)?
            .flatten_all()?
            .to_vec1::<u32>()?;
        Self::new(n_codebooks, n_frames, data)
    }

    fn validate_ids(&self, key: &str) -> Result<()> {
        match self.max_id() {
            Some(max) if max as usize >= CODEBOOK_SIZE => Err(BarkError::Format(format!(
                "{key} contains id {max}, expected ids below {CODEBOOK_SIZE}"
            ))),
            _ => Ok(()),
        }
    }
}

// ── Bundles ─────────────────────────────────────────────────────────────

/// Complete conditioning artifact ("full generation").
///
/// Immutable once built; reuse always reads the same arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceBundle {
    semantic_prompt: SemanticTokens,
    coarse_prompt: CodebookTokens,
    fine_prompt: CodebookTokens,
}

impl VoiceBundle {
    /// Validate shapes and id ranges and assemble the bundle.
    pub fn new(
        semantic_prompt: SemanticTokens,
        coarse_prompt: CodebookTokens,
        fine_prompt: CodebookTokens,
    ) -> Result<Self> {
        semantic_prompt.validate()?;
        if coarse_prompt.n_codebooks() != N_COARSE_CODEBOOKS {
            return Err(BarkError::Format(format!(
                "{COARSE_KEY} must have {N_COARSE_CODEBOOKS} rows, got {}",
                coarse_prompt.n_codebooks()
            )));
        }
        if fine_prompt.n_codebooks() < N_COARSE_CODEBOOKS {
            return Err(BarkError::Format(format!(
                "{FINE_KEY} must have at least {N_COARSE_CODEBOOKS} rows, got {}",
                fine_prompt.n_codebooks()
            )));
        }
        if coarse_prompt.n_frames() != fine_prompt.n_frames() {
            return Err(BarkError::Format(format!(
                "{COARSE_KEY} has {} frames but {FINE_KEY} has {}",
                coarse_prompt.n_frames(),
                fine_prompt.n_frames()
            )));
        }
        coarse_prompt.validate_ids(COARSE_KEY)?;
        fine_prompt.validate_ids(FINE_KEY)?;
        Ok(Self {
            semantic_prompt,
            coarse_prompt,
            fine_prompt,
        })
    }

    pub fn semantic_prompt(&self) -> &SemanticTokens {
        &self.semantic_prompt
    }

    pub fn coarse_prompt(&self) -> &CodebookTokens {
        &self.coarse_prompt
    }

    pub fn fine_prompt(&self) -> &CodebookTokens {
        &self.fine_prompt
    }

    pub fn as_history(&self) -> HistoryPrompt<'_> {
        HistoryPrompt::from(self)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_bundle(path, self)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_bundle(path)
    }
}

/// Borrowed conditioning view. A missing field means "unconditioned" for the
/// stage that would read it.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryPrompt<'a> {
    pub semantic_prompt: Option<&'a SemanticTokens>,
    pub coarse_prompt: Option<&'a CodebookTokens>,
    pub fine_prompt: Option<&'a CodebookTokens>,
}

impl<'a> From<&'a VoiceBundle> for HistoryPrompt<'a> {
    fn from(bundle: &'a VoiceBundle) -> Self {
        Self {
            semantic_prompt: Some(&bundle.semantic_prompt),
            coarse_prompt: Some(&bundle.coarse_prompt),
            fine_prompt: Some(&bundle.fine_prompt),
        }
    }
}

impl HistoryPrompt<'_> {
    pub fn is_empty(&self) -> bool {
        self.semantic_prompt.is_none() && self.coarse_prompt.is_none() && self.fine_prompt.is_none()
    }
}

/// Owned subset of a bundle, as loaded from a container that may lack fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialBundle {
    pub semantic_prompt: Option<SemanticTokens>,
    pub coarse_prompt: Option<CodebookTokens>,
    pub fine_prompt: Option<CodebookTokens>,
}

impl PartialBundle {
    pub fn as_history(&self) -> HistoryPrompt<'_> {
        HistoryPrompt {
            semantic_prompt: self.semantic_prompt.as_ref(),
            coarse_prompt: self.coarse_prompt.as_ref(),
            fine_prompt: self.fine_prompt.as_ref(),
        }
    }

    /// Promote to a full generation; fails if any field is absent.
    pub fn into_full(self) -> Result<VoiceBundle> {
        let missing = |key: &str| BarkError::Format(format!("bundle is missing `{key}`"));
        let semantic = self.semantic_prompt.ok_or_else(|| missing(SEMANTIC_KEY))?;
        let coarse = self.coarse_prompt.ok_or_else(|| missing(COARSE_KEY))?;
        let fine = self.fine_prompt.ok_or_else(|| missing(FINE_KEY))?;
        VoiceBundle::new(semantic, coarse, fine)
    }
}

impl TryFrom<PartialBundle> for VoiceBundle {
    type Error = BarkError;

    fn try_from(partial: PartialBundle) -> Result<Self> {
        partial.into_full()
    }
}

// ── Persistence ─────────────────────────────────────────────────────────

fn check_extension(path: &Path) -> Result<()> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(BUNDLE_EXTENSION) => Ok(()),
        _ => Err(BarkError::Format(format!(
            "bundle path {} must end with .{BUNDLE_EXTENSION}",
            path.display()
        ))),
    }
}

fn npz_error(path: &Path, e: candle_core::Error) -> BarkError {
    BarkError::Format(format!("{}: {e}", path.display()))
}

fn codebooks_to_i64(tokens: &CodebookTokens) -> candle_core::Result<Tensor> {
    let data: Vec<i64> = tokens.data.iter().map(|&id| id as i64).collect();
    Tensor::from_vec(data, (tokens.n_codebooks, tokens.n_frames), &Device::Cpu)
}

/// Persist a full generation as three named arrays in one `.npz` container.
pub fn save_bundle<P: AsRef<Path>>(path: P, bundle: &VoiceBundle) -> Result<()> {
    let path = path.as_ref();
    check_extension(path)?;

    let semantic: Vec<i64> = bundle.semantic_prompt.0.iter().map(|&id| id as i64).collect();
    let n_semantic = semantic.len();
    let semantic = Tensor::from_vec(semantic, n_semantic, &Device::Cpu)?;
    let coarse = codebooks_to_i64(&bundle.coarse_prompt)?;
    let fine = codebooks_to_i64(&bundle.fine_prompt)?;

    Tensor::write_npz(
        &[(SEMANTIC_KEY, &semantic), (COARSE_KEY, &coarse), (FINE_KEY, &fine)],
        path,
    )
    .map_err(|e| npz_error(path, e))?;
    tracing::debug!(
        path = %path.display(),
        semantic = n_semantic,
        frames = bundle.fine_prompt.n_frames(),
        "saved voice bundle"
    );
    Ok(())
}

fn to_u32_ids(key: &str, values: Vec<i64>) -> Result<Vec<u32>> {
    values
        .into_iter()
        .map(|v| {
            u32::try_from(v)
                .map_err(|_| BarkError::Format(format!("{key} contains out-of-range id {v}")))
        })
        .collect()
}

fn semantic_from_array(array: &Tensor) -> Result<SemanticTokens> {
    if array.rank() != 1 {
        return Err(BarkError::Format(format!(
            "{SEMANTIC_KEY} must be 1-D, got shape {:?}",
            array.dims()
        )));
    }
    let values = array.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    let tokens = SemanticTokens(to_u32_ids(SEMANTIC_KEY, values)?);
    tokens.validate()?;
    Ok(tokens)
}

fn codebooks_from_array(key: &str, array: &Tensor) -> Result<CodebookTokens> {
    let (n_codebooks, n_frames) = array
        .dims2()
        .map_err(|_| {
            BarkError::Format(format!("{key} must be 2-D, got shape {:?}", array.dims()))
        })?;
    let values = array.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
    let tokens = CodebookTokens::new(n_codebooks, n_frames, to_u32_ids(key, values)?)?;
    tokens.validate_ids(key)?;
    Ok(tokens)
}

/// Load whatever subset of the three arrays a container holds.
///
/// Used for conditioning; see [`load_bundle`] for the strict variant.
pub fn load_history_prompt<P: AsRef<Path>>(path: P) -> Result<PartialBundle> {
    let path = path.as_ref();
    check_extension(path)?;
    let arrays: HashMap<String, Tensor> = Tensor::read_npz(path)
        .map_err(|e| npz_error(path, e))?
        .into_iter()
        .collect();

    let semantic_prompt = arrays.get(SEMANTIC_KEY).map(semantic_from_array).transpose()?;
    let coarse_prompt = arrays
        .get(COARSE_KEY)
        .map(|a| codebooks_from_array(COARSE_KEY, a))
        .transpose()?;
    let fine_prompt = arrays
        .get(FINE_KEY)
        .map(|a| codebooks_from_array(FINE_KEY, a))
        .transpose()?;

    Ok(PartialBundle {
        semantic_prompt,
        coarse_prompt,
        fine_prompt,
    })
}

/// Load a full generation; every one of the three arrays must be present.
pub fn load_bundle<P: AsRef<Path>>(path: P) -> Result<VoiceBundle> {
    load_history_prompt(path)?.into_full()
}
