//! # cxr
//!
//! Chest radiograph classification with Grad-CAM explanations, on Burn.
//!
//! cxr-rs takes an encoded image, classifies it with an EfficientNet-B0
//! checkpoint and returns the predicted label with a heatmap overlay showing
//! which regions drove the decision:
//!
//! - **Transforms**: decode, resize and normalize uploads
//! - **Models**: EfficientNet-B0, PyTorch and native checkpoints, model registry
//! - **Explain**: Grad-CAM activation maps and overlay compositing
//! - **Infer**: classification, overlay encoding, the request pipeline
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cxr::prelude::*;
//!
//! let config = ServiceConfig::load(None)?;
//! let registry = Arc::new(ModelRegistry::<InferBackend>::new(
//!     &config.model_path,
//!     config.load_options(),
//! ));
//! registry.reload()?;
//!
//! let pipeline = Pipeline::from_config(registry, &config);
//! let response = pipeline.predict(&std::fs::read("chest.png")?)?;
//! println!("{} ({:.1}%)", response.label, response.probability * 100.0);
//! ```
//!
//! ## Feature Flags
//!
//! - `backend-ndarray` (default): CPU backend using ndarray
//! - `backend-wgpu`: GPU backend using WGPU (Metal on macOS, Vulkan on Linux/Windows)

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export all crates
pub use cxr_core as core;
pub use cxr_explain as explain;
pub use cxr_infer as infer;
pub use cxr_models as models;
pub use cxr_transforms as transforms;

/// Backend the service runs on: autodiff over the compiled tensor backend,
/// since every request takes gradients for its explanation.
#[cfg(feature = "backend-wgpu")]
pub type InferBackend = cxr_core::backend::Autodiff<cxr_core::backend::Wgpu>;

/// Backend the service runs on: autodiff over the compiled tensor backend,
/// since every request takes gradients for its explanation.
#[cfg(all(feature = "backend-ndarray", not(feature = "backend-wgpu")))]
pub type InferBackend = cxr_core::backend::Autodiff<cxr_core::backend::NdArray>;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use cxr::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use cxr_core::{DeviceResolver, DeviceSelection, FeatureExtractor, ImageClassifier};

    // Transforms
    pub use cxr_transforms::{
        ImageSample, NormalizedInput, Normalization, PreprocessConfig, PreprocessError,
        Preprocessor,
    };

    // Models
    pub use cxr_models::{
        EfficientNet, EfficientNetConfig, HealthReport, HealthStatus, LoadOptions,
        ModelLoadError, ModelRegistry, ModelState,
    };

    // Explain
    pub use cxr_explain::{
        ActivationMap, ColorRamp, Compositor, ExplainError, Explainer, OverlayConfig,
        OverlayImage, TargetLayers,
    };

    // Inference
    pub use cxr_infer::{
        EncodedPayload, Encoder, InferError, Pipeline, PipelineOutput, PredictResponse,
        PredictionResult, ServiceConfig,
    };

    #[cfg(any(feature = "backend-ndarray", feature = "backend-wgpu"))]
    pub use super::InferBackend;
}

/// All module for importing everything.
pub mod all {
    pub use super::prelude::*;

    // Additional exports
    pub use cxr_core::backend;
    pub use cxr_explain::{grad_cam, LayerSelector, DEFAULT_IMAGE_WEIGHT};
    pub use cxr_infer::{classify, Codec, JpegCodec, PngCodec};
    pub use cxr_models::{
        load_pytorch_classes, load_pytorch_record, load_record, save_model, CheckpointFormat,
        CheckpointMetadata, MbConvStageConfig, DEFAULT_LABELS,
    };
}
