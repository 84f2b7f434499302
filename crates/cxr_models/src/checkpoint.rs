//! Model checkpointing and serialization utilities.
//!
//! Provides utilities for saving and loading model weights using Burn's record
//! system, plus import of PyTorch state dicts produced by torchvision training
//! scripts.
//!
//! # Supported Formats
//!
//! - **Named MessagePack** (`*.mpk`): Burn's native record format
//! - **PyTorch** (`*.pt`, `*.pth`): `torch.save` checkpoints, either a bare
//!   state dict or a dict holding it under `model_state_dict`
//!
//! # Class Labels
//!
//! Training scripts usually save `{"model_state_dict": ..., "classes": [...]}`.
//! [`load_pytorch_classes`] reads the `classes` entry straight from the pickle.
//!
//! # Metadata Sidecar
//!
//! A JSON file next to the checkpoint (`best_model.pth.json` or
//! `best_model.json`) records what the weights cannot: class labels and the
//! normalization constants used during training.
//!
//! # Example
//!
//! ```rust,ignore
//! use cxr_models::checkpoint::{save_model, CheckpointMetadata};
//!
//! let model = EfficientNetConfig::b0(2).init::<NdArray>(&device);
//! save_model(&model, "model.mpk")?;
//! CheckpointMetadata::new(EFFICIENTNET_B0)
//!     .with_classes(vec!["NORMAL".into(), "PNEUMONIA".into()])
//!     .save("model.json")?;
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use burn::module::{Module, ModuleVisitor, ParamId};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use candle_core::pickle::{Object, Stack};
use cxr_transforms::Normalization;
use serde::{Deserialize, Serialize};
use zip::ZipArchive;

use crate::cnn::{EfficientNetConfig, EfficientNetRecord};
use crate::error::{ModelLoadError, Result};

/// Key under which training scripts store the state dict.
pub const STATE_DICT_KEY: &str = "model_state_dict";

/// Key under which training scripts store the class labels.
pub const CLASSES_KEY: &str = "classes";

/// Checkpoint format for model serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// Burn named MessagePack.
    NamedMessagePack,
    /// PyTorch pickle (`torch.save`).
    PyTorch,
}

impl CheckpointFormat {
    /// Infer the format from a file extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let ext = path
            .as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "mpk" => Ok(CheckpointFormat::NamedMessagePack),
            "pt" | "pth" => Ok(CheckpointFormat::PyTorch),
            other => Err(ModelLoadError::UnsupportedFormat(if other.is_empty() {
                "<no extension>".to_string()
            } else {
                other.to_string()
            })),
        }
    }
}

/// Save a model as a named MessagePack checkpoint.
pub fn save_model<B, M>(model: &M, path: impl AsRef<Path>) -> Result<()>
where
    B: Backend,
    M: Module<B>,
{
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    recorder
        .record(model.clone().into_record(), path.as_ref().to_path_buf())
        .map_err(|e| ModelLoadError::Save(e.to_string()))
}

/// Load a record from a named MessagePack checkpoint.
pub fn load_record<B, M>(path: impl AsRef<Path>, device: &B::Device) -> Result<M::Record>
where
    B: Backend,
    M: Module<B>,
{
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    recorder
        .load(path.as_ref().to_path_buf(), device)
        .map_err(|e| ModelLoadError::UnreadableCheckpoint(e.to_string()))
}

/// Load an EfficientNet record from a torchvision-style PyTorch checkpoint.
///
/// Tries the state dict under [`STATE_DICT_KEY`] first, then the whole file.
pub fn load_pytorch_record<B: Backend>(
    path: impl AsRef<Path>,
    config: &EfficientNetConfig,
    device: &B::Device,
) -> Result<EfficientNetRecord<B>> {
    let path = path.as_ref();
    let recorder = PyTorchFileRecorder::<FullPrecisionSettings>::default();

    let nested = torchvision_load_args(path, config).with_top_level_key(STATE_DICT_KEY);
    match recorder.load(nested, device) {
        Ok(record) => Ok(record),
        Err(nested_err) => {
            tracing::debug!(
                error = %nested_err,
                "no '{}' key in checkpoint, loading as bare state dict",
                STATE_DICT_KEY
            );
            recorder
                .load(torchvision_load_args(path, config), device)
                .map_err(|bare_err| {
                    ModelLoadError::UnreadableCheckpoint(format!(
                        "under '{}': {}; as bare state dict: {}",
                        STATE_DICT_KEY, nested_err, bare_err
                    ))
                })
        }
    }
}

/// Class labels stored in a PyTorch checkpoint under [`CLASSES_KEY`].
///
/// Returns `None` for bare state dicts and for archives whose pickle cannot be
/// parsed; the weight loader reports those files itself. A `classes` entry
/// that is not a list of strings is an error.
pub fn load_pytorch_classes(path: impl AsRef<Path>) -> Result<Option<Vec<String>>> {
    let path = path.as_ref();
    let root = match read_pickle_root(path) {
        Ok(root) => root,
        Err(reason) => {
            tracing::debug!(path = %path.display(), %reason, "checkpoint pickle not inspected for labels");
            return Ok(None);
        }
    };

    let entries = match root {
        Object::Dict(entries) => entries,
        _ => return Ok(None),
    };
    let value = entries
        .into_iter()
        .find(|(key, _)| matches!(key, Object::Unicode(key) if key == CLASSES_KEY))
        .map(|(_, value)| value);

    let items = match value {
        None => return Ok(None),
        Some(Object::List(items)) | Some(Object::Tuple(items)) => items,
        Some(other) => {
            return Err(ModelLoadError::InvalidMetadata(format!(
                "checkpoint '{}' entry is not a list: {:?}",
                CLASSES_KEY, other
            )))
        }
    };

    items
        .into_iter()
        .map(|item| match item {
            Object::Unicode(label) => Ok(label),
            other => Err(ModelLoadError::InvalidMetadata(format!(
                "checkpoint class label is not a string: {:?}",
                other
            ))),
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// Unpickle the `data.pkl` record of a `torch.save` zip archive.
fn read_pickle_root(path: &Path) -> std::result::Result<Object, String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| e.to_string())?;
    let name = archive
        .file_names()
        .find(|name| name.ends_with("data.pkl"))
        .map(str::to_string)
        .ok_or_else(|| "archive has no data.pkl".to_string())?;

    let entry = archive.by_name(&name).map_err(|e| e.to_string())?;
    let mut stack = Stack::empty();
    stack
        .read_loop(&mut BufReader::new(entry))
        .map_err(|e| e.to_string())?;
    stack.finalize().map_err(|e| e.to_string())
}

/// Check that a record has the stage layout of `config`.
///
/// Burn asserts on mismatched `Vec` lengths while applying a record, so depth
/// differences must be caught before [`Module::load_record`].
pub fn check_stage_depths<B: Backend>(
    config: &EfficientNetConfig,
    record: &EfficientNetRecord<B>,
) -> Result<()> {
    if record.stages.len() != config.stages.len() {
        return Err(ModelLoadError::ShapeMismatch {
            what: "stage count".to_string(),
            expected: config.stages.len(),
            got: record.stages.len(),
        });
    }
    for (index, (stage, blocks)) in config.stages.iter().zip(&record.stages).enumerate() {
        if blocks.len() != stage.n_layers {
            return Err(ModelLoadError::ShapeMismatch {
                what: format!("stage {} depth", index),
                expected: stage.n_layers,
                got: blocks.len(),
            });
        }
    }
    Ok(())
}

/// Shapes of every float tensor in `module`, in visit order.
pub fn parameter_shapes<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<usize>> {
    let mut collector = ShapeCollector::default();
    module.visit(&mut collector);
    collector.shapes
}

#[derive(Default)]
struct ShapeCollector {
    shapes: Vec<Vec<usize>>,
}

impl<B: Backend> ModuleVisitor<B> for ShapeCollector {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.shapes.push(tensor.dims().to_vec());
    }
}

/// Check that `loaded` holds tensors of the same shapes as `reference`.
///
/// Loading a record replaces tensors without looking at their shapes, so a
/// checkpoint for a different width only fails later inside a forward pass.
pub fn check_parameter_shapes<B: Backend, M: Module<B>>(reference: &M, loaded: &M) -> Result<()> {
    let expected = parameter_shapes::<B, M>(reference);
    let got = parameter_shapes::<B, M>(loaded);

    if expected.len() != got.len() {
        return Err(ModelLoadError::ShapeMismatch {
            what: "parameter count".to_string(),
            expected: expected.len(),
            got: got.len(),
        });
    }

    for (index, (want, have)) in expected.iter().zip(&got).enumerate() {
        let first_diff = want
            .iter()
            .zip(have)
            .enumerate()
            .find(|(_, (e, g))| e != g);
        if let Some((dim, (e, g))) = first_diff {
            return Err(ModelLoadError::ShapeMismatch {
                what: format!(
                    "parameter {} (shape {:?}, checkpoint {:?}) dim {}",
                    index, want, have, dim
                ),
                expected: *e,
                got: *g,
            });
        }
    }
    Ok(())
}

fn torchvision_load_args(path: &Path, config: &EfficientNetConfig) -> LoadArgs {
    torchvision_key_remap(config)
        .into_iter()
        .fold(LoadArgs::new(path.to_path_buf()), |args, (pattern, replacement)| {
            args.with_key_remap(&pattern, &replacement)
        })
}

/// Regex remaps from torchvision `efficientnet_*` keys to the module tree.
///
/// torchvision nests each MBConv as `features.{stage}.{block}.block.{part}`
/// where `part` counts the expansion conv only when the expand ratio is not 1.
pub fn torchvision_key_remap(config: &EfficientNetConfig) -> Vec<(String, String)> {
    let mut remap = vec![
        (r"^features\.0\.0\.(.+)$".to_string(), "stem.conv.$1".to_string()),
        (r"^features\.0\.1\.(.+)$".to_string(), "stem.norm.$1".to_string()),
    ];

    for (idx, stage) in config.stages.iter().enumerate() {
        let prefix = format!(r"^features\.{}\.(\d+)\.block\.", idx + 1);
        let target = format!("stages.{}.$1", idx);

        let mut parts = Vec::with_capacity(4);
        if stage.expand_ratio != 1 {
            parts.push("expand");
        }
        parts.extend(["depthwise", "se", "project"]);

        for (pos, part) in parts.into_iter().enumerate() {
            if part == "se" {
                remap.push((format!(r"{}{}\.(.+)$", prefix, pos), format!("{}.se.$2", target)));
            } else {
                remap.push((
                    format!(r"{}{}\.0\.(.+)$", prefix, pos),
                    format!("{}.{}.conv.$2", target, part),
                ));
                remap.push((
                    format!(r"{}{}\.1\.(.+)$", prefix, pos),
                    format!("{}.{}.norm.$2", target, part),
                ));
            }
        }
    }

    let head = config.stages.len() + 1;
    remap.push((format!(r"^features\.{}\.0\.(.+)$", head), "head.conv.$1".to_string()));
    remap.push((format!(r"^features\.{}\.1\.(.+)$", head), "head.norm.$1".to_string()));
    remap.push((r"^classifier\.1\.(.+)$".to_string(), "classifier.$1".to_string()));

    remap
}

/// Model checkpoint metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Model architecture name.
    #[serde(default)]
    pub arch: Option<String>,
    /// Class labels in output order.
    #[serde(default)]
    pub classes: Option<Vec<String>>,
    /// Square input size used in training.
    #[serde(default)]
    pub image_size: Option<usize>,
    /// Channel means used in training.
    #[serde(default)]
    pub mean: Option<[f32; 3]>,
    /// Channel standard deviations used in training.
    #[serde(default)]
    pub std: Option<[f32; 3]>,
    /// Training epoch (if applicable).
    #[serde(default)]
    pub epoch: Option<usize>,
    /// Validation accuracy (if applicable).
    #[serde(default)]
    pub val_acc: Option<f32>,
    /// Additional metadata.
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl CheckpointMetadata {
    /// Create new metadata for an architecture.
    pub fn new(arch: impl Into<String>) -> Self {
        Self {
            arch: Some(arch.into()),
            ..Default::default()
        }
    }

    /// Set the class labels.
    #[must_use]
    pub fn with_classes(mut self, classes: Vec<String>) -> Self {
        self.classes = Some(classes);
        self
    }

    /// Set the training image size.
    #[must_use]
    pub fn with_image_size(mut self, image_size: usize) -> Self {
        self.image_size = Some(image_size);
        self
    }

    /// Set the normalization constants.
    #[must_use]
    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.mean = Some(normalization.mean);
        self.std = Some(normalization.std);
        self
    }

    /// Set the training epoch.
    #[must_use]
    pub fn with_epoch(mut self, epoch: usize) -> Self {
        self.epoch = Some(epoch);
        self
    }

    /// Set the validation accuracy.
    #[must_use]
    pub fn with_val_acc(mut self, acc: f32) -> Self {
        self.val_acc = Some(acc);
        self
    }

    /// Add extra metadata.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Normalization constants, if the sidecar declares them.
    ///
    /// `mean` and `std` must appear together, and every deviation must be
    /// positive.
    pub fn normalization(&self) -> Result<Option<Normalization>> {
        match (self.mean, self.std) {
            (None, None) => Ok(None),
            (Some(mean), Some(std)) => Normalization::new(mean, std).map(Some).ok_or_else(|| {
                ModelLoadError::InvalidMetadata(format!(
                    "invalid normalization mean={:?} std={:?}",
                    mean, std
                ))
            }),
            _ => Err(ModelLoadError::InvalidMetadata(
                "'mean' and 'std' must be given together".to_string(),
            )),
        }
    }

    /// Save metadata to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| ModelLoadError::Save(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| ModelLoadError::Save(e.to_string()))
    }

    /// Load metadata from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ModelLoadError::InvalidMetadata(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&json)
            .map_err(|e| ModelLoadError::InvalidMetadata(format!("{}: {}", path.display(), e)))
    }

    /// Candidate sidecar locations for a checkpoint, in lookup order.
    pub fn sidecar_paths(checkpoint: impl AsRef<Path>) -> Vec<PathBuf> {
        let checkpoint = checkpoint.as_ref();
        let mut appended = checkpoint.as_os_str().to_owned();
        appended.push(".json");

        vec![PathBuf::from(appended), checkpoint.with_extension("json")]
    }

    /// Load the first sidecar found next to `checkpoint`, if any.
    pub fn discover(checkpoint: impl AsRef<Path>) -> Result<Option<(PathBuf, Self)>> {
        for candidate in Self::sidecar_paths(checkpoint) {
            if candidate.is_file() {
                let metadata = Self::load(&candidate)?;
                return Ok(Some((candidate, metadata)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cnn::MbConvStageConfig;

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            CheckpointFormat::from_path("models/best_model.pth").unwrap(),
            CheckpointFormat::PyTorch
        );
        assert_eq!(
            CheckpointFormat::from_path("model.PT").unwrap(),
            CheckpointFormat::PyTorch
        );
        assert_eq!(
            CheckpointFormat::from_path("model.mpk").unwrap(),
            CheckpointFormat::NamedMessagePack
        );
        assert!(matches!(
            CheckpointFormat::from_path("model.onnx"),
            Err(ModelLoadError::UnsupportedFormat(ext)) if ext == "onnx"
        ));
        assert!(CheckpointFormat::from_path("model").is_err());
    }

    #[test]
    fn test_checkpoint_metadata() {
        let meta = CheckpointMetadata::new("efficientnet_b0")
            .with_classes(vec!["NORMAL".into(), "PNEUMONIA".into()])
            .with_image_size(224)
            .with_epoch(10)
            .with_val_acc(0.92)
            .with_extra("dataset", "chest_xray");

        assert_eq!(meta.arch.as_deref(), Some("efficientnet_b0"));
        assert_eq!(meta.classes.as_ref().map(Vec::len), Some(2));
        assert_eq!(meta.image_size, Some(224));
        assert_eq!(meta.epoch, Some(10));
        assert_eq!(meta.extra.get("dataset"), Some(&"chest_xray".to_string()));
    }

    #[test]
    fn test_metadata_tolerates_missing_fields() {
        let meta: CheckpointMetadata = serde_json::from_str(r#"{"classes": ["A", "B", "C"]}"#).unwrap();
        assert!(meta.arch.is_none());
        assert_eq!(meta.classes.as_ref().unwrap().len(), 3);
        assert_eq!(meta.normalization().unwrap(), None);
    }

    #[test]
    fn test_metadata_normalization() {
        let meta: CheckpointMetadata = serde_json::from_str(
            r#"{"mean": [0.5, 0.5, 0.5], "std": [0.25, 0.25, 0.25]}"#,
        )
        .unwrap();
        let normalization = meta.normalization().unwrap().unwrap();
        assert_eq!(normalization.mean, [0.5; 3]);
        assert_eq!(normalization.std, [0.25; 3]);

        let round_trip = CheckpointMetadata::default().with_normalization(Normalization::IMAGENET);
        assert_eq!(round_trip.normalization().unwrap(), Some(Normalization::IMAGENET));

        let half: CheckpointMetadata = serde_json::from_str(r#"{"mean": [0.5, 0.5, 0.5]}"#).unwrap();
        assert!(matches!(half.normalization(), Err(ModelLoadError::InvalidMetadata(_))));

        let zero_std: CheckpointMetadata =
            serde_json::from_str(r#"{"mean": [0.5, 0.5, 0.5], "std": [0.0, 0.2, 0.2]}"#).unwrap();
        assert!(zero_std.normalization().is_err());
    }

    #[test]
    fn test_sidecar_discovery_prefers_appended_name() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("best_model.pth");

        assert!(CheckpointMetadata::discover(&checkpoint).unwrap().is_none());

        CheckpointMetadata::new("efficientnet_b0")
            .with_classes(vec!["X".into()])
            .save(dir.path().join("best_model.json"))
            .unwrap();
        let (path, meta) = CheckpointMetadata::discover(&checkpoint).unwrap().unwrap();
        assert_eq!(path, dir.path().join("best_model.json"));
        assert_eq!(meta.classes, Some(vec!["X".to_string()]));

        CheckpointMetadata::new("efficientnet_b0")
            .with_classes(vec!["Y".into()])
            .save(dir.path().join("best_model.pth.json"))
            .unwrap();
        let (path, meta) = CheckpointMetadata::discover(&checkpoint).unwrap().unwrap();
        assert_eq!(path, dir.path().join("best_model.pth.json"));
        assert_eq!(meta.classes, Some(vec!["Y".to_string()]));
    }

    #[test]
    fn test_malformed_sidecar_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("m.json"), "{not json").unwrap();
        assert!(matches!(
            CheckpointMetadata::discover(dir.path().join("m.mpk")),
            Err(ModelLoadError::InvalidMetadata(_))
        ));
    }

    fn apply(remap: &[(String, String)], key: &str) -> String {
        let mut name = key.to_string();
        for (pattern, replacement) in remap {
            let re = regex::Regex::new(pattern).unwrap();
            if re.is_match(&name) {
                name = re.replace_all(&name, replacement.as_str()).to_string();
            }
        }
        name
    }

    #[test]
    fn test_torchvision_remap_b0() {
        let remap = torchvision_key_remap(&EfficientNetConfig::b0(2));

        assert_eq!(apply(&remap, "features.0.0.weight"), "stem.conv.weight");
        assert_eq!(apply(&remap, "features.0.1.running_var"), "stem.norm.running_var");
        // Stage 1 has expand ratio 1: no expansion conv.
        assert_eq!(
            apply(&remap, "features.1.0.block.0.0.weight"),
            "stages.0.0.depthwise.conv.weight"
        );
        assert_eq!(
            apply(&remap, "features.1.0.block.1.fc2.bias"),
            "stages.0.0.se.fc2.bias"
        );
        assert_eq!(
            apply(&remap, "features.1.0.block.2.1.bias"),
            "stages.0.0.project.norm.bias"
        );
        // Later stages expand.
        assert_eq!(
            apply(&remap, "features.2.1.block.0.1.weight"),
            "stages.1.1.expand.norm.weight"
        );
        assert_eq!(
            apply(&remap, "features.6.3.block.1.0.weight"),
            "stages.5.3.depthwise.conv.weight"
        );
        assert_eq!(
            apply(&remap, "features.6.3.block.2.fc1.weight"),
            "stages.5.3.se.fc1.weight"
        );
        assert_eq!(
            apply(&remap, "features.7.0.block.3.0.weight"),
            "stages.6.0.project.conv.weight"
        );
        assert_eq!(apply(&remap, "features.8.0.weight"), "head.conv.weight");
        assert_eq!(apply(&remap, "features.8.1.running_mean"), "head.norm.running_mean");
        assert_eq!(apply(&remap, "classifier.1.weight"), "classifier.weight");
    }

    #[test]
    fn test_torchvision_remap_follows_stage_count() {
        let config = EfficientNetConfig::b0(2).with_stages(vec![
            MbConvStageConfig::new(1, 3, 1, 32, 16, 1),
            MbConvStageConfig::new(6, 3, 2, 16, 24, 2),
        ]);
        let remap = torchvision_key_remap(&config);

        assert_eq!(apply(&remap, "features.3.0.weight"), "head.conv.weight");
    }
}
