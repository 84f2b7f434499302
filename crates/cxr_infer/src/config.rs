//! Service configuration.
//!
//! Settings resolve in increasing precedence: built-in defaults, a JSON
//! config file, environment variables, then command-line flags (applied by
//! the binary).

use std::path::{Path, PathBuf};

use cxr_core::DeviceSelection;
use cxr_explain::{ColorRamp, OverlayConfig, TargetLayers, DEFAULT_IMAGE_WEIGHT};
use cxr_models::{EfficientNetConfig, LoadOptions};
use cxr_transforms::{DEFAULT_IMAGE_SIZE, DEFAULT_MAX_IMAGE_BYTES};
use serde::{Deserialize, Serialize};

use crate::encoder::DEFAULT_JPEG_QUALITY;
use crate::error::ConfigError;

/// Environment variable for the checkpoint path.
pub const ENV_MODEL_PATH: &str = "MODEL_PATH";
/// Environment variable for the input resolution.
pub const ENV_IMAGE_SIZE: &str = "IMG_SIZE";
/// Environment variable for the device.
pub const ENV_DEVICE: &str = "DEVICE";

/// Checkpoint path used when nothing else is configured.
pub const DEFAULT_MODEL_PATH: &str = "models/best_model.pth";
/// Listen address used when nothing else is configured.
pub const DEFAULT_BIND: &str = "0.0.0.0:8000";

/// Everything the service needs to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Checkpoint to load at startup.
    pub model_path: PathBuf,
    /// Square input resolution.
    pub image_size: usize,
    /// Compute device.
    pub device: DeviceSelection,
    /// Labels used when the checkpoint carries none.
    pub labels: Option<Vec<String>>,
    /// Grad-CAM layer preference.
    pub target_layers: TargetLayers,
    /// Weight of the source image in the overlay.
    pub image_weight: f32,
    /// Heatmap color ramp.
    pub color_ramp: ColorRamp,
    /// JPEG quality for the overlay.
    pub jpeg_quality: u8,
    /// Largest accepted upload.
    pub max_image_bytes: usize,
    /// HTTP listen address.
    pub bind: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            image_size: DEFAULT_IMAGE_SIZE,
            device: DeviceSelection::Auto,
            labels: None,
            target_layers: TargetLayers::default(),
            image_weight: DEFAULT_IMAGE_WEIGHT,
            color_ramp: ColorRamp::Jet,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

impl ServiceConfig {
    /// Defaults, overlaid with `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env(|var| std::env::var(var).ok())
    }

    /// Read a JSON config file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `MODEL_PATH`, `IMG_SIZE` and `DEVICE` from `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_MODEL_PATH).filter(|v| !v.is_empty()) {
            self.model_path = PathBuf::from(path);
        }
        if let Some(value) = lookup(ENV_IMAGE_SIZE) {
            self.image_size = value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_IMAGE_SIZE,
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(ENV_DEVICE) {
            self.device = value.parse().map_err(|_| ConfigError::Env {
                var: ENV_DEVICE,
                value: value.clone(),
            })?;
        }
        Ok(self)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_size == 0 {
            return Err(ConfigError::Invalid("image_size must be positive".into()));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "jpeg_quality must be in 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        if !(0.0..=1.0).contains(&self.image_weight) {
            return Err(ConfigError::Invalid(format!(
                "image_weight must be in [0, 1], got {}",
                self.image_weight
            )));
        }
        if self.target_layers.is_empty() {
            return Err(ConfigError::Invalid(
                "target_layers must name at least one layer".into(),
            ));
        }
        if self.max_image_bytes == 0 {
            return Err(ConfigError::Invalid("max_image_bytes must be positive".into()));
        }
        if matches!(&self.labels, Some(labels) if labels.is_empty()) {
            return Err(ConfigError::Invalid("labels must not be empty".into()));
        }
        Ok(())
    }

    /// Registry options for the EfficientNet-B0 architecture.
    pub fn load_options(&self) -> LoadOptions {
        let mut options = LoadOptions::default()
            .with_image_size(self.image_size)
            .with_device(self.device)
            .with_architecture(EfficientNetConfig::b0(2));
        options.labels = self.labels.clone();
        options
    }

    /// Overlay blending parameters.
    pub fn overlay_config(&self) -> OverlayConfig {
        OverlayConfig::default()
            .with_image_weight(self.image_weight)
            .with_ramp(self.color_ramp)
    }
}
