//! Attribution map computation.

use burn::prelude::*;

use crate::error::{ExplainError, Result};

/// Maps whose rectified maximum is at or below this carry no evidence.
pub const DEGENERATE_EPSILON: f32 = 1e-8;

/// Grayscale importance map with values in `[0, 1]`.
///
/// Always contains at least one `1.0`; maps that cannot be normalized are
/// rejected at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationMap {
    width: usize,
    height: usize,
    values: Vec<f32>,
    layer: usize,
    target_class: usize,
}

impl ActivationMap {
    /// Normalize a rectified, row-major `height×width` map.
    pub fn from_rectified(
        values: Vec<f32>,
        width: usize,
        height: usize,
        layer: usize,
        target_class: usize,
    ) -> Result<Self> {
        if values.len() != width * height || values.is_empty() {
            return Err(ExplainError::Backend(format!(
                "map has {} values for {}x{}",
                values.len(),
                width,
                height
            )));
        }
        let mut values = values;
        normalize_unit_interval(&mut values)?;

        Ok(Self {
            width,
            height,
            values,
            layer,
            target_class,
        })
    }

    /// Width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Row-major values.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Value at column `x`, row `y`.
    pub fn get(&self, x: usize, y: usize) -> Option<f32> {
        if x < self.width && y < self.height {
            self.values.get(y * self.width + x).copied()
        } else {
            None
        }
    }

    /// Feature layer the map was computed at.
    pub fn layer(&self) -> usize {
        self.layer
    }

    /// Class the map explains.
    pub fn target_class(&self) -> usize {
        self.target_class
    }
}

/// Rescale non-negative values into `[0, 1]` so the maximum becomes `1.0`.
///
/// Min-max scaling when the values have range, division by the maximum when
/// they are constant. Fails when the maximum shows no positive evidence.
pub fn normalize_unit_interval(values: &mut [f32]) -> Result<()> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ExplainError::NonFinite);
    }

    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if max <= DEGENERATE_EPSILON {
        return Err(ExplainError::Degenerate { max: max.max(0.0) });
    }

    let range = max - min;
    if range > DEGENERATE_EPSILON {
        for v in values.iter_mut() {
            *v = (*v - min) / range;
        }
    } else {
        for v in values.iter_mut() {
            *v /= max;
        }
    }
    Ok(())
}

/// Compute the unrectified Grad-CAM map.
///
/// # Arguments
///
/// * `activations` - Activations at the target layer (batch, channels, h, w)
/// * `gradients` - Gradients of the class score w.r.t. `activations`
///
/// # Returns
///
/// Map of shape (batch, 1, h, w).
pub fn grad_cam<B: Backend>(activations: Tensor<B, 4>, gradients: Tensor<B, 4>) -> Tensor<B, 4> {
    // Global average pool the gradients: (batch, channels, h, w) -> (batch, channels, 1, 1)
    let weights = gradients.mean_dim(3).mean_dim(2);

    // Weight the activations and sum across channels: -> (batch, 1, h, w)
    (activations * weights).sum_dim(1)
}

/// Clamp negative evidence to zero.
pub fn rectify<B: Backend>(cam: Tensor<B, 4>) -> Tensor<B, 4> {
    cam.clamp_min(0.0)
}

/// Read a tensor back to host memory.
pub(crate) fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| ExplainError::Backend(format!("{:?}", e)))
}
