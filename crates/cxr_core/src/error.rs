//! Error types for cxr_core.

use thiserror::Error;

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors shared by the cxr crates.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A device selection string could not be parsed.
    #[error("Invalid device selection '{0}': expected auto, cpu, gpu[:N] or cuda[:N]")]
    InvalidDevice(String),
}
