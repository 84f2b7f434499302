//! Model registry owning the active classifier.
//!
//! The registry is an explicit context object handed to every consumer. It
//! holds at most one [`ModelState`]; a load builds the replacement completely
//! and only then swaps it in, so readers always see either the old or the new
//! state and a failed load leaves the old one serving.
//!
//! # Example
//!
//! ```rust,ignore
//! use cxr_models::{LoadOptions, ModelRegistry};
//!
//! let registry = ModelRegistry::<NdArray>::new("models/best_model.pth", LoadOptions::default());
//! if let Err(e) = registry.reload() {
//!     tracing::error!(error = %e, "model unavailable");
//! }
//! let state = registry.current().ok_or(...)?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::prelude::*;
use cxr_core::{DeviceResolver, DeviceSelection};
use cxr_transforms::{Normalization, DEFAULT_IMAGE_SIZE};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{
    check_parameter_shapes, check_stage_depths, load_pytorch_classes, load_pytorch_record,
    load_record, CheckpointFormat, CheckpointMetadata,
};
use crate::cnn::{EfficientNet, EfficientNetConfig, EFFICIENTNET_B0};
use crate::error::{ModelLoadError, Result};
use crate::state::ModelState;

/// Labels used when neither the checkpoint nor the configuration names any.
pub const DEFAULT_LABELS: [&str; 2] = ["NORMAL", "PNEUMONIA"];

/// Options applied to every load.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Square input resolution the service feeds the model.
    pub image_size: usize,
    /// Requested compute device.
    pub device: DeviceSelection,
    /// Configured labels, used when neither the checkpoint nor its sidecar
    /// carries any.
    pub labels: Option<Vec<String>>,
    /// Architecture to load weights into. The class count is replaced by the
    /// classifier width found in the checkpoint.
    pub architecture: EfficientNetConfig,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            image_size: DEFAULT_IMAGE_SIZE,
            device: DeviceSelection::Auto,
            labels: None,
            architecture: EfficientNetConfig::default(),
        }
    }
}

impl LoadOptions {
    /// Set the input resolution.
    #[must_use]
    pub fn with_image_size(mut self, image_size: usize) -> Self {
        self.image_size = image_size;
        self
    }

    /// Set the device.
    #[must_use]
    pub fn with_device(mut self, device: DeviceSelection) -> Self {
        self.device = device;
        self
    }

    /// Set fallback labels.
    #[must_use]
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = Some(labels);
        self
    }

    /// Set the architecture.
    #[must_use]
    pub fn with_architecture(mut self, architecture: EfficientNetConfig) -> Self {
        self.architecture = architecture;
        self
    }
}

/// Whether a model is currently being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// A model is loaded.
    Ok,
    /// No model is loaded.
    Unloaded,
}

/// Health report returned to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Load status.
    pub status: HealthStatus,
    /// Device the model runs (or would run) on.
    pub device: String,
}

/// Owner of the active [`ModelState`].
pub struct ModelRegistry<B: DeviceResolver> {
    options: LoadOptions,
    device: B::Device,
    device_label: String,
    slot: RwLock<Slot<B>>,
}

/// Path and state change together under one lock.
struct Slot<B: DeviceResolver> {
    model_path: PathBuf,
    state: Option<Arc<ModelState<B>>>,
}

/// Where the class labels of a load came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabelSource {
    Checkpoint,
    Sidecar,
    Configured,
    Default,
}

impl<B: DeviceResolver> ModelRegistry<B> {
    /// Create an empty registry configured to load from `model_path`.
    pub fn new(model_path: impl Into<PathBuf>, options: LoadOptions) -> Self {
        let device = B::resolve_device(options.device);
        let device_label = B::device_label(&device);

        Self {
            options,
            device,
            device_label,
            slot: RwLock::new(Slot {
                model_path: model_path.into(),
                state: None,
            }),
        }
    }

    /// Load options.
    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Path the next [`reload`](Self::reload) reads.
    pub fn model_path(&self) -> PathBuf {
        self.slot.read().model_path.clone()
    }

    /// Snapshot of the active state, if any.
    pub fn current(&self) -> Option<Arc<ModelState<B>>> {
        self.slot.read().state.clone()
    }

    /// Whether a model is loaded.
    pub fn is_loaded(&self) -> bool {
        self.slot.read().state.is_some()
    }

    /// Load from the configured path.
    pub fn reload(&self) -> Result<Arc<ModelState<B>>> {
        let path = self.model_path();
        self.load(path)
    }

    /// Load from `path`, replacing the active state on success.
    ///
    /// On success `path` becomes the path for later reloads.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Arc<ModelState<B>>> {
        let path = path.as_ref();
        match self.build_state(path) {
            Ok(state) => {
                let state = Arc::new(state);
                let mut slot = self.slot.write();
                slot.state = Some(Arc::clone(&state));
                slot.model_path = path.to_path_buf();
                Ok(state)
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "model load failed");
                Err(e)
            }
        }
    }

    /// Drop the active state. Requests holding a snapshot finish normally.
    pub fn unload(&self) -> Option<Arc<ModelState<B>>> {
        let previous = self.slot.write().state.take();
        if previous.is_some() {
            tracing::info!("model unloaded");
        }
        previous
    }

    /// Current health.
    pub fn health(&self) -> HealthReport {
        let status = if self.is_loaded() {
            HealthStatus::Ok
        } else {
            HealthStatus::Unloaded
        };
        HealthReport {
            status,
            device: self.device_label.clone(),
        }
    }

    fn build_state(&self, path: &Path) -> Result<ModelState<B>> {
        if !path.is_file() {
            return Err(ModelLoadError::NotFound(path.to_path_buf()));
        }
        let format = CheckpointFormat::from_path(path)?;

        let metadata = match CheckpointMetadata::discover(path)? {
            Some((sidecar, metadata)) => {
                tracing::debug!(sidecar = %sidecar.display(), "using checkpoint metadata");
                metadata
            }
            None => CheckpointMetadata::default(),
        };
        self.check_metadata(&metadata)?;
        let normalization = metadata.normalization()?.unwrap_or(Normalization::IMAGENET);

        let embedded = match format {
            CheckpointFormat::PyTorch => load_pytorch_classes(path)?,
            CheckpointFormat::NamedMessagePack => None,
        };

        let architecture = self.options.architecture.clone();
        architecture
            .validate()
            .map_err(ModelLoadError::IncompatibleMetadata)?;

        let record = match format {
            CheckpointFormat::NamedMessagePack => {
                load_record::<B, EfficientNet<B>>(path, &self.device)?
            }
            CheckpointFormat::PyTorch => {
                load_pytorch_record::<B>(path, &architecture, &self.device)?
            }
        };
        check_stage_depths(&architecture, &record)?;

        // Records carry their own tensor shapes, so the classifier width read
        // back after loading is the checkpoint's class count.
        let model: EfficientNet<B> = architecture.init(&self.device).load_record(record);
        let n_classes = model.classifier_outputs();

        let (labels, source) = self.resolve_labels(embedded, &metadata)?;
        if labels.len() != n_classes {
            return Err(ModelLoadError::ShapeMismatch {
                what: format!("classifier output ({:?} labels)", source),
                expected: labels.len(),
                got: n_classes,
            });
        }
        if model.classifier_inputs() != model.head_channels() {
            return Err(ModelLoadError::ShapeMismatch {
                what: "classifier input".to_string(),
                expected: model.head_channels(),
                got: model.classifier_inputs(),
            });
        }

        let config = architecture.with_n_classes(n_classes);
        let reference: EfficientNet<B> = config.init(&self.device);
        check_parameter_shapes::<B, EfficientNet<B>>(&reference, &model)?;

        tracing::info!(
            path = %path.display(),
            format = ?format,
            device = %self.device_label,
            labels = ?labels,
            label_source = ?source,
            "model loaded"
        );

        Ok(ModelState::new(
            model,
            labels,
            self.device.clone(),
            self.device_label.clone(),
            normalization,
            self.options.image_size,
            path.to_path_buf(),
            config,
        ))
    }

    fn check_metadata(&self, metadata: &CheckpointMetadata) -> Result<()> {
        if let Some(arch) = metadata.arch.as_deref() {
            if arch != EFFICIENTNET_B0 {
                return Err(ModelLoadError::IncompatibleMetadata(format!(
                    "architecture '{}' is not supported, expected '{}'",
                    arch, EFFICIENTNET_B0
                )));
            }
        }
        if let Some(image_size) = metadata.image_size {
            if image_size != self.options.image_size {
                return Err(ModelLoadError::IncompatibleMetadata(format!(
                    "checkpoint was trained at {}px but the service runs at {}px",
                    image_size, self.options.image_size
                )));
            }
        }
        Ok(())
    }

    fn resolve_labels(
        &self,
        embedded: Option<Vec<String>>,
        metadata: &CheckpointMetadata,
    ) -> Result<(Vec<String>, LabelSource)> {
        let (labels, source) = match (embedded, &metadata.classes, &self.options.labels) {
            (Some(classes), _, _) => (classes, LabelSource::Checkpoint),
            (None, Some(classes), _) => (classes.clone(), LabelSource::Sidecar),
            (None, None, Some(configured)) => (configured.clone(), LabelSource::Configured),
            (None, None, None) => (
                DEFAULT_LABELS.iter().map(|s| s.to_string()).collect(),
                LabelSource::Default,
            ),
        };
        if labels.is_empty() {
            return Err(ModelLoadError::EmptyLabels);
        }
        Ok((labels, source))
    }
}

impl<B: DeviceResolver> std::fmt::Debug for ModelRegistry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.read();
        f.debug_struct("ModelRegistry")
            .field("model_path", &slot.model_path)
            .field("device", &self.device_label)
            .field("loaded", &slot.state.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::save_model;
    use crate::cnn::MbConvStageConfig;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn tiny_config(n_classes: usize) -> EfficientNetConfig {
        EfficientNetConfig::b0(n_classes)
            .with_stem_channels(8)
            .with_stages(vec![
                MbConvStageConfig::new(1, 3, 1, 8, 8, 1),
                MbConvStageConfig::new(2, 3, 2, 8, 16, 1),
            ])
            .with_head_channels(16)
    }

    fn options() -> LoadOptions {
        LoadOptions::default()
            .with_image_size(32)
            .with_architecture(tiny_config(2))
    }

    fn write_checkpoint(dir: &Path, name: &str, n_classes: usize) -> PathBuf {
        let device = Default::default();
        let model = tiny_config(n_classes).init::<TestBackend>(&device);
        let path = dir.join(name);
        save_model::<TestBackend, _>(&model, &path).unwrap();
        path
    }

    #[test]
    fn test_missing_file_leaves_registry_unloaded() {
        let registry = ModelRegistry::<TestBackend>::new("does/not/exist.pth", options());

        assert!(matches!(registry.reload(), Err(ModelLoadError::NotFound(_))));
        assert!(registry.current().is_none());
        assert_eq!(
            registry.health(),
            HealthReport {
                status: HealthStatus::Unloaded,
                device: "cpu".to_string()
            }
        );
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"onnx").unwrap();

        let registry = ModelRegistry::<TestBackend>::new(&path, options());
        assert!(matches!(
            registry.reload(),
            Err(ModelLoadError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_load_native_checkpoint_with_default_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_checkpoint(dir.path(), "model.mpk", 2);

        let registry = ModelRegistry::<TestBackend>::new(&path, options());
        let state = registry.reload().unwrap();

        assert_eq!(state.labels(), &["NORMAL".to_string(), "PNEUMONIA".to_string()]);
        assert_eq!(state.image_size(), 32);
        assert_eq!(state.n_feature_layers(), 4);
        assert_eq!(state.normalization(), Normalization::IMAGENET);
        assert_eq!(registry.health().status, HealthStatus::Ok);
    }

    #[test]
    fn test_sidecar_labels_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_checkpoint(dir.path(), "model.mpk", 3);
        CheckpointMetadata::new(EFFICIENTNET_B0)
            .with_classes(vec!["A".into(), "B".into(), "C".into()])
            .save(dir.path().join("model.mpk.json"))
            .unwrap();

        let options = options().with_labels(vec!["X".into(), "Y".into()]);
        let registry = ModelRegistry::<TestBackend>::new(&path, options);
        let state = registry.reload().unwrap();

        assert_eq!(state.n_classes(), 3);
        assert_eq!(state.labels()[2], "C");
    }

    #[test]
    fn test_label_count_must_match_classifier() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_checkpoint(dir.path(), "good.mpk", 2);
        let bad = write_checkpoint(dir.path(), "bad.mpk", 2);
        CheckpointMetadata::default()
            .with_classes(vec!["A".into(), "B".into(), "C".into()])
            .save(dir.path().join("bad.json"))
            .unwrap();

        let registry = ModelRegistry::<TestBackend>::new(&good, options());
        let before = registry.reload().unwrap();

        let err = registry.load(&bad).unwrap_err();
        assert!(matches!(
            err,
            ModelLoadError::ShapeMismatch {
                expected: 3,
                got: 2,
                ..
            }
        ));

        let after = registry.current().unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(registry.model_path(), good);
    }

    #[test]
    fn test_intermediate_width_mismatch_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_checkpoint(dir.path(), "good.mpk", 2);

        let wide = dir.path().join("wide.mpk");
        let wide_config = EfficientNetConfig::b0(2)
            .with_stem_channels(12)
            .with_stages(vec![
                MbConvStageConfig::new(1, 3, 1, 12, 12, 1),
                MbConvStageConfig::new(2, 3, 2, 12, 16, 1),
            ])
            .with_head_channels(16);
        let model = wide_config.init::<TestBackend>(&Default::default());
        save_model::<TestBackend, _>(&model, &wide).unwrap();

        let registry = ModelRegistry::<TestBackend>::new(&good, options());
        let before = registry.reload().unwrap();

        let err = registry.load(&wide).unwrap_err();
        assert!(
            matches!(
                err,
                ModelLoadError::ShapeMismatch {
                    expected: 8,
                    got: 12,
                    ..
                }
            ),
            "{}",
            err
        );
        assert!(Arc::ptr_eq(&before, &registry.current().unwrap()));
        assert_eq!(registry.model_path(), good);
    }

    #[test]
    fn test_stage_depth_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("deep.mpk");
        let deep_config = tiny_config(2).with_stages(vec![
            MbConvStageConfig::new(1, 3, 1, 8, 8, 1),
            MbConvStageConfig::new(2, 3, 2, 8, 16, 2),
        ]);
        let model = deep_config.init::<TestBackend>(&Default::default());
        save_model::<TestBackend, _>(&model, &deep).unwrap();

        let registry = ModelRegistry::<TestBackend>::new(&deep, options());
        assert!(matches!(
            registry.reload(),
            Err(ModelLoadError::ShapeMismatch {
                expected: 1,
                got: 2,
                ..
            })
        ));

        let shallow = dir.path().join("shallow.mpk");
        let shallow_config =
            tiny_config(2).with_stages(vec![MbConvStageConfig::new(1, 3, 1, 8, 8, 1)]);
        let model = shallow_config.init::<TestBackend>(&Default::default());
        save_model::<TestBackend, _>(&model, &shallow).unwrap();

        assert!(matches!(
            registry.load(&shallow),
            Err(ModelLoadError::ShapeMismatch {
                expected: 2,
                got: 1,
                ..
            })
        ));
        assert!(!registry.is_loaded());
    }

    #[test]
    fn test_path_and_state_swap_together() {
        let dir = tempfile::tempdir().unwrap();
        let two = write_checkpoint(dir.path(), "two.mpk", 2);
        let three = write_checkpoint(dir.path(), "three.mpk", 3);
        CheckpointMetadata::default()
            .with_classes(vec!["A".into(), "B".into(), "C".into()])
            .save(dir.path().join("three.json"))
            .unwrap();

        let registry = Arc::new(ModelRegistry::<TestBackend>::new(&two, options()));
        registry.reload().unwrap();

        let reader = {
            let registry = Arc::clone(&registry);
            let (two, three) = (two.clone(), three.clone());
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let state = registry.current().unwrap();
                    let expected = if state.source() == two {
                        2
                    } else {
                        assert_eq!(state.source(), three);
                        3
                    };
                    assert_eq!(state.n_classes(), expected);
                    assert_eq!(state.labels().len(), expected);
                }
            })
        };

        for i in 0..10 {
            let path = if i % 2 == 0 { &three } else { &two };
            let state = registry.load(path).unwrap();
            assert_eq!(state.source(), path.as_path());
        }
        reader.join().unwrap();

        let state = registry.current().unwrap();
        assert_eq!(registry.model_path(), state.source());
        assert_eq!(state.n_classes(), 2);
    }

    #[test]
    fn test_incompatible_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_checkpoint(dir.path(), "model.mpk", 2);

        CheckpointMetadata::new("resnet50")
            .save(dir.path().join("model.json"))
            .unwrap();
        let registry = ModelRegistry::<TestBackend>::new(&path, options());
        assert!(matches!(
            registry.reload(),
            Err(ModelLoadError::IncompatibleMetadata(_))
        ));

        CheckpointMetadata::new(EFFICIENTNET_B0)
            .with_image_size(224)
            .save(dir.path().join("model.json"))
            .unwrap();
        assert!(matches!(
            registry.reload(),
            Err(ModelLoadError::IncompatibleMetadata(_))
        ));
    }

    #[test]
    fn test_empty_labels_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_checkpoint(dir.path(), "model.mpk", 2);
        CheckpointMetadata::default()
            .with_classes(Vec::new())
            .save(dir.path().join("model.json"))
            .unwrap();

        let registry = ModelRegistry::<TestBackend>::new(&path, options());
        assert!(matches!(registry.reload(), Err(ModelLoadError::EmptyLabels)));
    }

    #[test]
    fn test_corrupt_checkpoint_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.mpk");
        std::fs::write(&path, b"definitely not messagepack").unwrap();

        let registry = ModelRegistry::<TestBackend>::new(&path, options());
        assert!(matches!(
            registry.reload(),
            Err(ModelLoadError::UnreadableCheckpoint(_))
        ));
    }

    #[test]
    fn test_reload_swaps_and_unload_clears() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_checkpoint(dir.path(), "model.mpk", 2);

        let registry = ModelRegistry::<TestBackend>::new(&path, options());
        let first = registry.reload().unwrap();
        let second = registry.reload().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        let held = registry.current().unwrap();
        assert!(registry.unload().is_some());
        assert!(registry.current().is_none());
        assert_eq!(held.n_classes(), 2);
        assert!(registry.unload().is_none());
    }
}
