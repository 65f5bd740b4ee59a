//! Error types for the generation pipeline.

use thiserror::Error;

/// Main error type for `bark-core`.
#[derive(Error, Debug)]
pub enum BarkError {
    /// A caller-supplied argument is invalid (empty transcript, unknown speaker, ...).
    #[error("invalid input: {0}")]
    Input(String),

    /// A bundle container failed the extension or required-fields check.
    #[error("format error: {0}")]
    Format(String),

    /// A derived numeric parameter is non-positive or otherwise unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The generative model or codec raised. Never retried.
    #[error("upstream model failure: {0}")]
    Upstream(#[from] candle_core::Error),

    /// Audio decoding, encoding or resampling failed.
    #[error("audio error: {0}")]
    Audio(String),

    /// Text tokenizer failure.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<hound::Error> for BarkError {
    fn from(e: hound::Error) -> Self {
        match e {
            hound::Error::IoError(io) => Self::Io(io),
            other => Self::Audio(other.to_string()),
        }
    }
}

/// Result type alias for `bark-core` operations.
pub type Result<T> = std::result::Result<T, BarkError>;
