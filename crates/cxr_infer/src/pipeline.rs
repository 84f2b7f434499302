//! End-to-end request pipeline.
//!
//! bytes → preprocess → classify → explain → composite → encode.
//! Only a missing model and a bad image fail the request; explanation and
//! encoding problems are logged and leave the heatmap empty.

use std::sync::Arc;
use std::time::Instant;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use cxr_core::DeviceResolver;
use cxr_explain::{ActivationMap, Compositor, Explainer, OverlayImage};
use cxr_models::ModelRegistry;
use cxr_transforms::{PreprocessConfig, Preprocessor, DEFAULT_MAX_IMAGE_BYTES};
use serde::{Deserialize, Serialize};

use crate::classifier::{classify, PredictionResult};
use crate::config::ServiceConfig;
use crate::encoder::{EncodedPayload, Encoder};
use crate::error::{InferError, Result};

/// Everything one request produced.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Classification outcome.
    pub prediction: PredictionResult,
    /// Importance map, absent when explanation failed.
    pub activation: Option<ActivationMap>,
    /// Composited overlay, absent when explanation failed.
    pub overlay: Option<OverlayImage>,
    /// Encoded overlay.
    pub payload: EncodedPayload,
}

impl PipelineOutput {
    /// The wire response.
    pub fn to_response(&self) -> PredictResponse {
        PredictResponse {
            label: self.prediction.label.clone(),
            probability: self.prediction.probability,
            heatmap: self.payload.to_data_url(),
        }
    }
}

/// Classification response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    /// Predicted label.
    pub label: String,
    /// Probability of the predicted label.
    pub probability: f32,
    /// Overlay as a data URL, or empty.
    pub heatmap: String,
}

/// Request pipeline bound to a model registry.
pub struct Pipeline<B: AutodiffBackend + DeviceResolver> {
    registry: Arc<ModelRegistry<B>>,
    explainer: Explainer,
    compositor: Compositor,
    encoder: Encoder,
    max_image_bytes: usize,
}

impl<B: AutodiffBackend + DeviceResolver> Pipeline<B> {
    /// Create with default explanation, overlay and encoding settings.
    pub fn new(registry: Arc<ModelRegistry<B>>) -> Self {
        Self {
            registry,
            explainer: Explainer::default(),
            compositor: Compositor::default(),
            encoder: Encoder::default(),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }

    /// Create with settings from `config`.
    pub fn from_config(registry: Arc<ModelRegistry<B>>, config: &ServiceConfig) -> Self {
        Self::new(registry)
            .with_explainer(Explainer::new(config.target_layers.clone()))
            .with_compositor(Compositor::new(config.overlay_config()))
            .with_encoder(Encoder::with_jpeg_quality(config.jpeg_quality))
            .with_max_image_bytes(config.max_image_bytes)
    }

    /// Replace the explainer.
    #[must_use]
    pub fn with_explainer(mut self, explainer: Explainer) -> Self {
        self.explainer = explainer;
        self
    }

    /// Replace the compositor.
    #[must_use]
    pub fn with_compositor(mut self, compositor: Compositor) -> Self {
        self.compositor = compositor;
        self
    }

    /// Replace the encoder.
    #[must_use]
    pub fn with_encoder(mut self, encoder: Encoder) -> Self {
        self.encoder = encoder;
        self
    }

    /// Set the upload size limit.
    #[must_use]
    pub fn with_max_image_bytes(mut self, max_image_bytes: usize) -> Self {
        self.max_image_bytes = max_image_bytes;
        self
    }

    /// The registry this pipeline reads from.
    pub fn registry(&self) -> &Arc<ModelRegistry<B>> {
        &self.registry
    }

    /// Upload size limit.
    pub fn max_image_bytes(&self) -> usize {
        self.max_image_bytes
    }

    /// Run every stage on one encoded image.
    pub fn run(&self, bytes: &[u8]) -> Result<PipelineOutput> {
        let start = Instant::now();
        let state = self.registry.current().ok_or(InferError::ModelNotLoaded)?;

        let preprocessor = Preprocessor::new(
            PreprocessConfig::new(state.image_size())
                .with_normalization(state.normalization())
                .with_max_bytes(self.max_image_bytes),
        );
        let sample = preprocessor.decode(bytes)?;
        let input = preprocessor.normalize(&sample);

        let model = state.handle().no_grad();
        let prediction = classify::<B, _>(&model, state.labels(), &input, state.device())?;
        let classified = start.elapsed();

        let activation = match self.explainer.explain::<B, _>(
            &model,
            &input,
            state.device(),
            prediction.class_index,
        ) {
            Ok(map) => Some(map),
            Err(e) => {
                tracing::warn!(error = %e, label = %prediction.label, "explanation failed, heatmap omitted");
                None
            }
        };

        let overlay = activation
            .as_ref()
            .map(|map| self.compositor.composite(&sample, map));
        let payload = match &overlay {
            Some(overlay) => self.encoder.encode(overlay),
            None => EncodedPayload::Failed,
        };

        tracing::debug!(
            label = %prediction.label,
            probability = prediction.probability,
            classify_ms = classified.as_millis() as u64,
            total_ms = start.elapsed().as_millis() as u64,
            heatmap = payload.is_encoded(),
            "prediction complete"
        );

        Ok(PipelineOutput {
            prediction,
            activation,
            overlay,
            payload,
        })
    }

    /// Run the pipeline and shape the wire response.
    pub fn predict(&self, bytes: &[u8]) -> Result<PredictResponse> {
        self.run(bytes).map(|output| output.to_response())
    }
}

impl<B: AutodiffBackend + DeviceResolver> std::fmt::Debug for Pipeline<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("registry", &self.registry)
            .field("explainer", &self.explainer)
            .field("compositor", &self.compositor)
            .field("encoder", &self.encoder)
            .finish()
    }
}
