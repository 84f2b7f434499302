//! Error types for cxr_transforms.

use thiserror::Error;

/// Result type alias using [`PreprocessError`].
pub type Result<T> = std::result::Result<T, PreprocessError>;

/// Errors raised while turning request bytes into model input.
///
/// Every variant is a client-side problem with the submitted image.
#[derive(Error, Debug)]
pub enum PreprocessError {
    /// Zero-byte payload.
    #[error("Invalid image: empty payload")]
    EmptyPayload,

    /// Payload exceeds the configured maximum.
    #[error("Invalid image: payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Payload size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// Bytes could not be decoded as a supported image format.
    #[error("Invalid image: {0}")]
    Decode(String),

    /// Decoded image has no pixels.
    #[error("Invalid image: zero-sized image ({width}x{height})")]
    ZeroSized {
        /// Decoded width.
        width: u32,
        /// Decoded height.
        height: u32,
    },
}
