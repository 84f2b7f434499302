//! # cxr_models
//!
//! Chest X-ray classifier architecture, checkpoint I/O and the model registry.
//!
//! ## Architecture
//! - [`EfficientNet`] - EfficientNet-B0 in torchvision layout with frozen
//!   batch-norm and an addressable feature stack for Grad-CAM
//!
//! ## Checkpoints
//! - Burn named MessagePack (`*.mpk`) via [`save_model`] / [`load_record`]
//! - PyTorch state dicts (`*.pt`, `*.pth`) via [`load_pytorch_record`], with
//!   embedded class labels via [`load_pytorch_classes`]
//! - Per-tensor shape validation via [`check_parameter_shapes`]
//! - JSON [`CheckpointMetadata`] sidecar for labels and normalization
//!
//! ## Serving
//! - [`ModelRegistry`] - owns the active [`ModelState`], swapped wholesale
//!   on reload

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod cnn;
mod error;
pub mod registry;
mod state;
pub mod traits;

pub use checkpoint::{
    check_parameter_shapes, check_stage_depths, load_pytorch_classes, load_pytorch_record,
    load_record, parameter_shapes, save_model, torchvision_key_remap, CheckpointFormat,
    CheckpointMetadata, CLASSES_KEY, STATE_DICT_KEY,
};
pub use cnn::*;
pub use error::{ModelLoadError, Result};
pub use registry::{
    HealthReport, HealthStatus, LoadOptions, ModelRegistry, DEFAULT_LABELS,
};
pub use state::ModelState;
