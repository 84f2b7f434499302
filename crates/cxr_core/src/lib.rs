//! # cxr_core
//!
//! Core types and traits for cxr-rs chest radiograph inference.
//!
//! This crate provides:
//! - [`ImageClassifier`] and [`FeatureExtractor`] model traits
//! - [`DeviceSelection`] and the [`DeviceResolver`] backend hook
//! - Error types and backend aliases
//!
//! ## Shape Convention
//!
//! Image tensors follow the convention `(B, C, H, W)`:
//! - `B`: Batch size (always 1 on the request path)
//! - `C`: Channels (3, RGB)
//! - `H`, `W`: Spatial size (`S×S` after preprocessing)

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod device;
mod error;
mod model_trait;

pub use device::{DeviceResolver, DeviceSelection};
pub use error::{CoreError, Result};
pub use model_trait::{FeatureExtractor, ImageClassifier};

/// Backend type aliases for convenience
pub mod backend {
    pub use burn_autodiff::Autodiff;

    #[cfg(feature = "backend-ndarray")]
    pub use burn_ndarray::NdArray;

    #[cfg(feature = "backend-wgpu")]
    pub use burn_wgpu::Wgpu;
}
