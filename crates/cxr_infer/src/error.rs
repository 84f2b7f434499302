//! Error types for inference.

use cxr_transforms::PreprocessError;
use thiserror::Error;

/// Result type alias using [`InferError`].
pub type Result<T> = std::result::Result<T, InferError>;

/// Request-level failures.
///
/// Only these reach the caller; explanation and encoding problems degrade the
/// response instead.
#[derive(Error, Debug)]
pub enum InferError {
    /// No model is loaded.
    #[error("Model not loaded")]
    ModelNotLoaded,

    /// The payload is not a usable image.
    #[error(transparent)]
    InvalidImage(#[from] PreprocessError),

    /// The forward pass produced something unusable.
    #[error("Inference failed: {0}")]
    Backend(String),
}

impl InferError {
    /// Whether the caller sent bad input.
    pub fn is_client_error(&self) -> bool {
        matches!(self, InferError::InvalidImage(_))
    }
}

/// A single codec failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{codec} encoding failed: {reason}")]
pub struct EncodeError {
    /// Codec name.
    pub codec: &'static str,
    /// What went wrong.
    pub reason: String,
}

/// Invalid service configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// Config file path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for the schema.
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        /// Config file path.
        path: String,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// An environment variable holds an unusable value.
    #[error("Invalid value for {var}: '{value}'")]
    Env {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },

    /// A setting is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
