//! EfficientNet image classifier.
//!
//! Layout follows torchvision's `efficientnet_b0` so PyTorch checkpoints map
//! onto it one-to-one:
//!
//! - `features.0`: stem conv (stride 2) + norm + SiLU
//! - `features.1..=N`: MBConv stages
//! - `features.N+1`: 1×1 head conv + norm + SiLU
//! - global average pool, then the linear `classifier`
//!
//! Dropout and stochastic depth only matter during training and are not
//! materialized.
//!
//! Reference: Tan & Le, "EfficientNet: Rethinking Model Scaling for
//! Convolutional Neural Networks", ICML 2019.

use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    Linear, LinearConfig,
};
use burn::prelude::*;
use burn::tensor::activation::{sigmoid, silu, softmax};
use serde::{Deserialize, Serialize};

use super::norm::ConvNorm;

/// Architecture name recorded in checkpoint metadata.
pub const EFFICIENTNET_B0: &str = "efficientnet_b0";

/// One MBConv stage: `n_layers` blocks sharing kernel size and expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MbConvStageConfig {
    /// Channel expansion ratio of the inverted bottleneck.
    pub expand_ratio: usize,
    /// Depthwise kernel size.
    pub kernel_size: usize,
    /// Stride of the first block in the stage.
    pub stride: usize,
    /// Input channels of the first block.
    pub in_channels: usize,
    /// Output channels of every block.
    pub out_channels: usize,
    /// Number of blocks.
    pub n_layers: usize,
}

impl MbConvStageConfig {
    /// Create a stage config.
    pub fn new(
        expand_ratio: usize,
        kernel_size: usize,
        stride: usize,
        in_channels: usize,
        out_channels: usize,
        n_layers: usize,
    ) -> Self {
        Self {
            expand_ratio,
            kernel_size,
            stride,
            in_channels,
            out_channels,
            n_layers,
        }
    }
}

/// Configuration for [`EfficientNet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EfficientNetConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Stem output channels.
    pub stem_channels: usize,
    /// MBConv stages, in order.
    pub stages: Vec<MbConvStageConfig>,
    /// Head conv output channels (classifier input width).
    pub head_channels: usize,
    /// Number of output classes.
    pub n_classes: usize,
    /// Batch-norm epsilon.
    pub bn_epsilon: f64,
}

impl Default for EfficientNetConfig {
    fn default() -> Self {
        Self::b0(2)
    }
}

impl EfficientNetConfig {
    /// EfficientNet-B0 with a `n_classes`-way head.
    pub fn b0(n_classes: usize) -> Self {
        Self {
            in_channels: 3,
            stem_channels: 32,
            stages: vec![
                MbConvStageConfig::new(1, 3, 1, 32, 16, 1),
                MbConvStageConfig::new(6, 3, 2, 16, 24, 2),
                MbConvStageConfig::new(6, 5, 2, 24, 40, 2),
                MbConvStageConfig::new(6, 3, 2, 40, 80, 3),
                MbConvStageConfig::new(6, 5, 1, 80, 112, 3),
                MbConvStageConfig::new(6, 5, 2, 112, 192, 4),
                MbConvStageConfig::new(6, 3, 1, 192, 320, 1),
            ],
            head_channels: 1280,
            n_classes,
            bn_epsilon: 1e-5,
        }
    }

    /// Set the number of output classes.
    #[must_use]
    pub fn with_n_classes(mut self, n_classes: usize) -> Self {
        self.n_classes = n_classes;
        self
    }

    /// Set the stem width.
    #[must_use]
    pub fn with_stem_channels(mut self, channels: usize) -> Self {
        self.stem_channels = channels;
        self
    }

    /// Replace the stage list.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<MbConvStageConfig>) -> Self {
        self.stages = stages;
        self
    }

    /// Set the head width.
    #[must_use]
    pub fn with_head_channels(mut self, channels: usize) -> Self {
        self.head_channels = channels;
        self
    }

    /// Number of addressable feature layers (stem + stages + head).
    pub fn n_feature_layers(&self) -> usize {
        self.stages.len() + 2
    }

    /// Check that consecutive stages agree on channel counts.
    pub fn validate(&self) -> Result<(), String> {
        if self.n_classes == 0 {
            return Err("n_classes must be positive".to_string());
        }
        let mut channels = self.stem_channels;
        for (idx, stage) in self.stages.iter().enumerate() {
            if stage.in_channels != channels {
                return Err(format!(
                    "stage {} expects {} input channels but receives {}",
                    idx, stage.in_channels, channels
                ));
            }
            if stage.n_layers == 0 || stage.expand_ratio == 0 || stage.kernel_size % 2 == 0 {
                return Err(format!("stage {} has an invalid block configuration", idx));
            }
            channels = stage.out_channels;
        }
        Ok(())
    }

    /// Initialize the model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> EfficientNet<B> {
        EfficientNet::new(self.clone(), device)
    }
}

/// Mean over the spatial dims: (b, c, h, w) -> (b, c, 1, 1).
fn global_avg_pool<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.mean_dim(3).mean_dim(2)
}

/// Squeeze-and-excitation channel gate.
#[derive(Module, Debug)]
pub struct SqueezeExcitation<B: Backend> {
    fc1: Conv2d<B>,
    fc2: Conv2d<B>,
}

impl<B: Backend> SqueezeExcitation<B> {
    /// Create a gate over `channels` with a `squeeze_channels` bottleneck.
    pub fn new(channels: usize, squeeze_channels: usize, device: &B::Device) -> Self {
        Self {
            fc1: Conv2dConfig::new([channels, squeeze_channels], [1, 1]).init(device),
            fc2: Conv2dConfig::new([squeeze_channels, channels], [1, 1]).init(device),
        }
    }

    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = global_avg_pool(x.clone());
        let scale = silu(self.fc1.forward(scale));
        let scale = sigmoid(self.fc2.forward(scale));
        x * scale
    }
}

/// Inverted residual block with depthwise conv and squeeze-excitation.
#[derive(Module, Debug)]
pub struct MbConv<B: Backend> {
    expand: Option<ConvNorm<B>>,
    depthwise: ConvNorm<B>,
    se: SqueezeExcitation<B>,
    project: ConvNorm<B>,
}

impl<B: Backend> MbConv<B> {
    /// Create a block.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        kernel_size: usize,
        stride: usize,
        epsilon: f64,
        device: &B::Device,
    ) -> Self {
        let expanded = in_channels * expand_ratio;

        let expand = (expand_ratio != 1)
            .then(|| ConvNorm::new(in_channels, expanded, 1, 1, 1, epsilon, device));
        let depthwise =
            ConvNorm::new(expanded, expanded, kernel_size, stride, expanded, epsilon, device);
        let se = SqueezeExcitation::new(expanded, (in_channels / 4).max(1), device);
        let project = ConvNorm::new(expanded, out_channels, 1, 1, 1, epsilon, device);

        Self {
            expand,
            depthwise,
            se,
            project,
        }
    }

    /// Forward pass.
    ///
    /// The residual connection applies whenever the block preserves shape,
    /// which for this architecture is exactly stride 1 with equal channels.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = match &self.expand {
            Some(expand) => silu(expand.forward(x.clone())),
            None => x.clone(),
        };
        let out = silu(self.depthwise.forward(out));
        let out = self.se.forward(out);
        let out = self.project.forward(out);

        if out.dims() == x.dims() {
            out + x
        } else {
            out
        }
    }
}

/// EfficientNet classifier with an addressable feature stack.
#[derive(Module, Debug)]
pub struct EfficientNet<B: Backend> {
    stem: ConvNorm<B>,
    stages: Vec<Vec<MbConv<B>>>,
    head: ConvNorm<B>,
    classifier: Linear<B>,
}

impl<B: Backend> EfficientNet<B> {
    /// Create a new randomly initialized model.
    pub fn new(config: EfficientNetConfig, device: &B::Device) -> Self {
        let eps = config.bn_epsilon;
        let stem = ConvNorm::new(config.in_channels, config.stem_channels, 3, 2, 1, eps, device);

        let mut stages = Vec::with_capacity(config.stages.len());
        let mut last_channels = config.stem_channels;
        for stage in &config.stages {
            let mut blocks = Vec::with_capacity(stage.n_layers);
            for layer in 0..stage.n_layers {
                let (in_channels, stride) = if layer == 0 {
                    (stage.in_channels, stage.stride)
                } else {
                    (stage.out_channels, 1)
                };
                blocks.push(MbConv::new(
                    in_channels,
                    stage.out_channels,
                    stage.expand_ratio,
                    stage.kernel_size,
                    stride,
                    eps,
                    device,
                ));
            }
            stages.push(blocks);
            last_channels = stage.out_channels;
        }

        let head = ConvNorm::new(last_channels, config.head_channels, 1, 1, 1, eps, device);
        let classifier = LinearConfig::new(config.head_channels, config.n_classes).init(device);

        Self {
            stem,
            stages,
            head,
            classifier,
        }
    }

    /// Number of addressable feature layers (stem + stages + head).
    pub fn n_feature_layers(&self) -> usize {
        self.stages.len() + 2
    }

    /// Classifier input width.
    pub fn classifier_inputs(&self) -> usize {
        self.classifier.weight.val().dims()[0]
    }

    /// Classifier output width, i.e. number of classes.
    pub fn classifier_outputs(&self) -> usize {
        self.classifier.weight.val().dims()[1]
    }

    /// Head conv output width.
    pub fn head_channels(&self) -> usize {
        self.head.out_channels()
    }

    /// Forward pass returning logits.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut out = silu(self.stem.forward(x));
        for stage in &self.stages {
            for block in stage {
                out = block.forward(out);
            }
        }
        let out = silu(self.head.forward(out));
        self.pool_and_classify(out)
    }

    /// Forward pass returning probabilities.
    pub fn forward_probs(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(x), 1)
    }

    /// Run the feature stack up to and including `layer`.
    pub fn forward_features(&self, x: Tensor<B, 4>, layer: usize) -> Option<Tensor<B, 4>> {
        let last = self.n_feature_layers().checked_sub(1)?;
        if layer > last {
            return None;
        }

        let mut out = silu(self.stem.forward(x));
        if layer == 0 {
            return Some(out);
        }
        for (idx, stage) in self.stages.iter().enumerate() {
            for block in stage {
                out = block.forward(out);
            }
            if layer == idx + 1 {
                return Some(out);
            }
        }
        Some(silu(self.head.forward(out)))
    }

    /// Continue from the output of feature layer `layer` to logits.
    pub fn forward_head(&self, activations: Tensor<B, 4>, layer: usize) -> Option<Tensor<B, 2>> {
        let last = self.n_feature_layers().checked_sub(1)?;
        if layer > last {
            return None;
        }

        let mut out = activations;
        // Stage `i` is feature layer `i + 1`, so skipping `layer` stages leaves
        // exactly the ones after it.
        for stage in self.stages.iter().skip(layer) {
            for block in stage {
                out = block.forward(out);
            }
        }
        if layer < last {
            out = silu(self.head.forward(out));
        }
        Some(self.pool_and_classify(out))
    }

    fn pool_and_classify(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let out = global_avg_pool(x);
        let [batch, channels, _, _] = out.dims();
        let out = out.reshape([batch, channels]);
        self.classifier.forward(out)
    }
}
