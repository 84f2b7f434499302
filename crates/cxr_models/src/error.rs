//! Error types for model loading.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using [`ModelLoadError`].
pub type Result<T> = std::result::Result<T, ModelLoadError>;

/// Reasons a checkpoint could not become the active model.
///
/// A failed load never touches the previously active model.
#[derive(Error, Debug)]
pub enum ModelLoadError {
    /// Checkpoint file does not exist.
    #[error("Model file not found at {0}")]
    NotFound(PathBuf),

    /// File extension does not name a supported checkpoint format.
    #[error("Unsupported checkpoint format: {0}")]
    UnsupportedFormat(String),

    /// Checkpoint exists but could not be decoded into the architecture.
    #[error("Failed to read checkpoint: {0}")]
    UnreadableCheckpoint(String),

    /// Metadata sidecar exists but is malformed.
    #[error("Invalid checkpoint metadata: {0}")]
    InvalidMetadata(String),

    /// Metadata sidecar contradicts the serving configuration.
    #[error("Incompatible checkpoint metadata: {0}")]
    IncompatibleMetadata(String),

    /// No class labels could be resolved.
    #[error("Checkpoint declares no class labels")]
    EmptyLabels,

    /// Loaded weights do not fit the expected architecture.
    #[error("Shape mismatch in {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Which tensor or dimension disagreed.
        what: String,
        /// Expected size.
        expected: usize,
        /// Size found in the checkpoint.
        got: usize,
    },

    /// Failed to write a checkpoint.
    #[error("Failed to save checkpoint: {0}")]
    Save(String),
}
