//! # cxr_infer
//!
//! Inference service for cxr-rs: classification, overlay encoding and the
//! request pipeline tying them to a [`cxr_models::ModelRegistry`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use cxr_infer::{Pipeline, ServiceConfig};
//!
//! let config = ServiceConfig::load(None)?;
//! let registry = Arc::new(ModelRegistry::<Autodiff<NdArray>>::new(
//!     &config.model_path,
//!     config.load_options(),
//! ));
//! registry.reload()?;
//! let response = Pipeline::from_config(registry, &config).predict(&bytes)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classifier;
pub mod config;
pub mod encoder;
mod error;
pub mod pipeline;

pub use classifier::{argmax, classify, PredictionResult};
pub use config::ServiceConfig;
pub use encoder::{Codec, EncodedPayload, Encoder, JpegCodec, PngCodec, DEFAULT_JPEG_QUALITY};
pub use error::{ConfigError, EncodeError, InferError, Result};
pub use pipeline::{Pipeline, PipelineOutput, PredictResponse};
