//! # cxr_transforms
//!
//! Deterministic preprocessing from request bytes to model input.
//!
//! This crate provides:
//! - [`Preprocessor`]: decode, resize to `S×S`, per-channel normalization
//! - [`ImageSample`]: the decoded RGB raster, kept for overlay compositing
//! - [`NormalizedInput`]: the `(3, S, S)` tensor payload fed to the classifier
//!
//! ## Example
//!
//! ```rust,ignore
//! use cxr_transforms::{PreprocessConfig, Preprocessor};
//!
//! let pre = Preprocessor::new(PreprocessConfig::new(224));
//! let sample = pre.decode(&bytes)?;
//! let input = pre.normalize(&sample);
//! let x = input.to_tensor::<NdArray>(&device);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
pub mod preprocess;

pub use error::{PreprocessError, Result};
pub use preprocess::{
    ImageSample, NormalizedInput, Normalization, PreprocessConfig, Preprocessor, CHANNELS,
    DEFAULT_IMAGE_SIZE, DEFAULT_MAX_IMAGE_BYTES,
};
