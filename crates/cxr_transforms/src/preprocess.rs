//! Radiograph preprocessing.
//!
//! Turns arbitrary encoded image bytes into the fixed-size, channel-normalized
//! raster the classifier was trained on:
//!
//! 1. Decode (format sniffed from content) and convert to RGB8
//! 2. Resize to `S×S` with a bilinear (triangle) filter, ignoring aspect ratio
//! 3. Scale to `[0, 1]` and normalize per channel with fixed mean/std
//!
//! The mean/std pair belongs to the checkpoint and is read from its metadata.

use burn::prelude::*;
use burn::tensor::TensorData;
use image::imageops::FilterType;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::{PreprocessError, Result};

/// Default square input resolution.
pub const DEFAULT_IMAGE_SIZE: usize = 224;

/// Default upper bound on request payload size (32 MiB).
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 32 * 1024 * 1024;

/// Number of color channels fed to the model.
pub const CHANNELS: usize = 3;

/// Per-channel normalization constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    /// Channel means (R, G, B) on the `[0, 1]` scale.
    pub mean: [f32; 3],
    /// Channel standard deviations (R, G, B).
    pub std: [f32; 3],
}

impl Normalization {
    /// ImageNet statistics, used by torchvision-pretrained backbones.
    pub const IMAGENET: Normalization = Normalization {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };

    /// Create normalization constants, rejecting non-positive deviations.
    pub fn new(mean: [f32; 3], std: [f32; 3]) -> Option<Self> {
        if std.iter().all(|s| s.is_finite() && *s > 0.0) && mean.iter().all(|m| m.is_finite()) {
            Some(Self { mean, std })
        } else {
            None
        }
    }

    /// Normalize one channel value already scaled to `[0, 1]`.
    #[inline]
    pub fn apply(&self, channel: usize, value: f32) -> f32 {
        (value - self.mean[channel]) / self.std[channel]
    }
}

impl Default for Normalization {
    fn default() -> Self {
        Self::IMAGENET
    }
}

/// Configuration for [`Preprocessor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Square output resolution `S`.
    pub image_size: usize,
    /// Channel normalization constants.
    pub normalization: Normalization,
    /// Largest accepted payload in bytes.
    pub max_bytes: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            image_size: DEFAULT_IMAGE_SIZE,
            normalization: Normalization::IMAGENET,
            max_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

impl PreprocessConfig {
    /// Create a config for the given resolution with ImageNet statistics.
    pub fn new(image_size: usize) -> Self {
        Self {
            image_size,
            ..Default::default()
        }
    }

    /// Set the normalization constants.
    #[must_use]
    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    /// Set the payload limit.
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

/// A decoded RGB image at its source resolution.
#[derive(Debug, Clone)]
pub struct ImageSample {
    image: RgbImage,
}

impl ImageSample {
    /// Wrap an already decoded raster.
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    /// Source width in pixels.
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Source height in pixels.
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Borrow the raster.
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Resize to `size×size` with the same filter the model input uses.
    pub fn resized(&self, size: usize) -> RgbImage {
        let size = size as u32;
        if self.image.width() == size && self.image.height() == size {
            return self.image.clone();
        }
        image::imageops::resize(&self.image, size, size, FilterType::Triangle)
    }
}

/// Normalized model input laid out as `(3, S, S)`, channel-major.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedInput {
    data: Vec<f32>,
    size: usize,
}

impl NormalizedInput {
    /// Build from raw channel-major values.
    ///
    /// Returns `None` if `data.len() != 3 * size * size`.
    pub fn from_vec(data: Vec<f32>, size: usize) -> Option<Self> {
        (data.len() == CHANNELS * size * size).then_some(Self { data, size })
    }

    /// Spatial side length `S`.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Raw channel-major values.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Shape of the batched tensor, `[1, 3, S, S]`.
    pub fn shape(&self) -> [usize; 4] {
        [1, CHANNELS, self.size, self.size]
    }

    /// Materialize as a batch of one on the given device.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        let data = TensorData::new(self.data.clone(), self.shape());
        Tensor::from_data(data, device)
    }
}

/// Deterministic bytes-to-tensor transform.
#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    /// Create a preprocessor from config.
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Square output resolution `S`.
    pub fn image_size(&self) -> usize {
        self.config.image_size
    }

    /// Decode request bytes into an RGB sample.
    pub fn decode(&self, bytes: &[u8]) -> Result<ImageSample> {
        if bytes.is_empty() {
            return Err(PreprocessError::EmptyPayload);
        }
        if bytes.len() > self.config.max_bytes {
            return Err(PreprocessError::PayloadTooLarge {
                size: bytes.len(),
                limit: self.config.max_bytes,
            });
        }

        let decoded =
            image::load_from_memory(bytes).map_err(|e| PreprocessError::Decode(e.to_string()))?;
        let rgb = decoded.to_rgb8();
        if rgb.width() == 0 || rgb.height() == 0 {
            return Err(PreprocessError::ZeroSized {
                width: rgb.width(),
                height: rgb.height(),
            });
        }

        tracing::debug!(width = rgb.width(), height = rgb.height(), "decoded image");
        Ok(ImageSample::new(rgb))
    }

    /// Resize and normalize a decoded sample.
    pub fn normalize(&self, sample: &ImageSample) -> NormalizedInput {
        let size = self.config.image_size;
        let resized = sample.resized(size);
        let plane = size * size;
        let norm = &self.config.normalization;

        let mut data = vec![0.0f32; CHANNELS * plane];
        for (idx, pixel) in resized.pixels().enumerate() {
            for channel in 0..CHANNELS {
                let value = pixel.0[channel] as f32 / 255.0;
                data[channel * plane + idx] = norm.apply(channel, value);
            }
        }

        NormalizedInput { data, size }
    }

    /// Decode, resize and normalize in one step.
    pub fn prepare(&self, bytes: &[u8]) -> Result<NormalizedInput> {
        let sample = self.decode(bytes)?;
        Ok(self.normalize(&sample))
    }
}
