//! # cxr_explain
//!
//! Grad-CAM explanations and heatmap overlays for cxr-rs.
//!
//! This crate provides:
//! - [`Explainer`]: gradient-weighted class activation mapping at a
//!   selectable feature layer
//! - [`TargetLayers`]: ordered layer preference (`features.last`, `features.N`)
//! - [`ActivationMap`]: normalized `[0, 1]` importance map
//! - [`Compositor`]: color ramp and blend onto the source image

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod attribution;
mod compositor;
mod error;
mod explainer;
mod layer;

pub use attribution::{grad_cam, normalize_unit_interval, rectify, ActivationMap, DEGENERATE_EPSILON};
pub use compositor::{
    ColorRamp, Compositor, OverlayConfig, OverlayImage, DEFAULT_IMAGE_WEIGHT,
};
pub use error::{ExplainError, Result};
pub use explainer::Explainer;
pub use layer::{LayerSelector, ParseLayerError, TargetLayers};
