//! Loaded model state shared by all requests.

use std::path::{Path, PathBuf};

use burn::prelude::*;
use cxr_transforms::Normalization;
use parking_lot::Mutex;

use crate::cnn::{EfficientNet, EfficientNetConfig};

/// A fully validated model together with everything needed to serve it.
///
/// Immutable after construction; a reload builds a new state and swaps it in.
///
/// Burn modules are `Send` but not `Sync` (parameters are lazily initialized
/// behind `OnceCell`), so the module sits behind a mutex and each request
/// works on its own clone. Cloning shares tensor storage.
#[derive(Debug)]
pub struct ModelState<B: Backend> {
    model: Mutex<EfficientNet<B>>,
    labels: Vec<String>,
    device: B::Device,
    device_label: String,
    normalization: Normalization,
    image_size: usize,
    source: PathBuf,
    config: EfficientNetConfig,
}

impl<B: Backend> ModelState<B> {
    /// Assemble a state. Callers are expected to have validated `labels`
    /// against the classifier output width.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        model: EfficientNet<B>,
        labels: Vec<String>,
        device: B::Device,
        device_label: String,
        normalization: Normalization,
        image_size: usize,
        source: PathBuf,
        config: EfficientNetConfig,
    ) -> Self {
        Self {
            model: Mutex::new(model),
            labels,
            device,
            device_label,
            normalization,
            image_size,
            source,
            config,
        }
    }

    /// A per-request handle to the model.
    pub fn handle(&self) -> EfficientNet<B> {
        self.model.lock().clone()
    }

    /// Class labels in classifier output order.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Number of classes.
    pub fn n_classes(&self) -> usize {
        self.labels.len()
    }

    /// Device the weights live on.
    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Human-readable device name.
    pub fn device_label(&self) -> &str {
        &self.device_label
    }

    /// Normalization constants the model was trained with.
    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// Square input resolution.
    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// Checkpoint the weights came from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Architecture the weights were loaded into.
    pub fn config(&self) -> &EfficientNetConfig {
        &self.config
    }

    /// Number of addressable feature layers.
    pub fn n_feature_layers(&self) -> usize {
        self.config.n_feature_layers()
    }
}
