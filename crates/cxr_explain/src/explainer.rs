//! Grad-CAM explainer.
//!
//! The forward pass is split at the target layer: activations `A` are
//! detached and marked as a gradient leaf, the rest of the network runs on
//! top of them, and the class score is backpropagated to `A` only. Gradient
//! state lives in the request's own graph, so concurrent explanations on
//! cloned model handles never interfere.

use std::time::Instant;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use cxr_core::FeatureExtractor;
use cxr_transforms::NormalizedInput;

use crate::attribution::{grad_cam, rectify, to_host, ActivationMap, DEGENERATE_EPSILON};
use crate::error::{ExplainError, Result};
use crate::layer::TargetLayers;

/// Gradient-weighted class activation mapping.
#[derive(Debug, Clone, Default)]
pub struct Explainer {
    target_layers: TargetLayers,
}

impl Explainer {
    /// Create an explainer trying `target_layers` in order.
    pub fn new(target_layers: TargetLayers) -> Self {
        Self { target_layers }
    }

    /// Configured layer preference.
    pub fn target_layers(&self) -> &TargetLayers {
        &self.target_layers
    }

    /// Explain `class` for a preprocessed input.
    ///
    /// The returned map has the input's spatial size.
    pub fn explain<B, M>(
        &self,
        model: &M,
        input: &NormalizedInput,
        device: &B::Device,
        class: usize,
    ) -> Result<ActivationMap>
    where
        B: AutodiffBackend,
        M: FeatureExtractor<B>,
    {
        self.explain_tensor(model, input.to_tensor::<B>(device), class)
    }

    /// Explain `class` for a single-image batch of shape (1, 3, h, w).
    pub fn explain_tensor<B, M>(&self, model: &M, x: Tensor<B, 4>, class: usize) -> Result<ActivationMap>
    where
        B: AutodiffBackend,
        M: FeatureExtractor<B>,
    {
        let start = Instant::now();
        let [_, _, height, width] = x.dims();

        let n_classes = model.n_classes();
        if class >= n_classes {
            return Err(ExplainError::InvalidClass { class, n_classes });
        }
        let layer = self.target_layers.resolve(model.n_feature_layers())?;
        let no_layer = || ExplainError::NoTargetLayer {
            requested: format!("features.{}", layer),
            available: model.n_feature_layers(),
        };

        let activations = model
            .forward_features(x, layer)
            .ok_or_else(no_layer)?
            .detach()
            .require_grad();
        let logits = model
            .forward_head(activations.clone(), layer)
            .ok_or_else(no_layer)?;

        let score = logits.slice([0..1, class..class + 1]).sum();
        let grads = score.backward();
        let gradients = activations
            .grad(&grads)
            .ok_or(ExplainError::MissingGradient)?;

        let cam = grad_cam(activations.inner(), gradients);
        let [_, _, cam_height, cam_width] = cam.dims();

        let raw = to_host(cam.clone())?;
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(ExplainError::NonFinite);
        }

        let cam = rectify(cam);
        let max = raw.iter().fold(0.0f32, |acc, &v| acc.max(v));
        if max <= DEGENERATE_EPSILON {
            return Err(ExplainError::Degenerate { max });
        }

        let upsampled = if (cam_height, cam_width) == (height, width) {
            cam
        } else {
            interpolate(
                cam,
                [height, width],
                InterpolateOptions::new(InterpolateMode::Bilinear),
            )
        };
        let map = ActivationMap::from_rectified(to_host(upsampled)?, width, height, layer, class)?;

        tracing::debug!(
            layer,
            class,
            feature_size = ?(cam_height, cam_width),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "activation map computed"
        );
        Ok(map)
    }
}
