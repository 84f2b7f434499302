//! Frozen batch normalization.
//!
//! Burn's `BatchNorm` switches to batch statistics whenever the backend tracks
//! gradients. The explain pass runs on an autodiff backend with a batch of one,
//! so that would both change the activations being explained and update the
//! running statistics. This layer always normalizes with the stored running
//! statistics.
//!
//! Field names follow the PyTorch state dict (`weight`, `bias`,
//! `running_mean`, `running_var`) so checkpoints map onto it without renaming.

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;

/// Batch normalization that always applies running statistics.
#[derive(Module, Debug)]
pub struct FrozenBatchNorm<B: Backend> {
    weight: Param<Tensor<B, 1>>,
    bias: Param<Tensor<B, 1>>,
    running_mean: Param<Tensor<B, 1>>,
    running_var: Param<Tensor<B, 1>>,
    epsilon: f64,
}

impl<B: Backend> FrozenBatchNorm<B> {
    /// Identity-initialized normalization over `channels`.
    pub fn new(channels: usize, epsilon: f64, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::ones([channels], device)),
            bias: Param::from_tensor(Tensor::zeros([channels], device)),
            running_mean: Param::from_tensor(Tensor::zeros([channels], device)),
            running_var: Param::from_tensor(Tensor::ones([channels], device)),
            epsilon,
        }
    }

    /// Number of normalized channels.
    pub fn channels(&self) -> usize {
        self.weight.val().dims()[0]
    }

    /// Normalize a (batch, channels, height, width) tensor.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let channels = self.channels();

        let scale = self.weight.val() / (self.running_var.val() + self.epsilon).sqrt();
        let shift = self.bias.val() - self.running_mean.val() * scale.clone();

        x * scale.reshape([1, channels, 1, 1]) + shift.reshape([1, channels, 1, 1])
    }
}

/// Convolution followed by frozen batch normalization, no bias on the conv.
///
/// Mirrors torchvision's `Conv2dNormActivation` minus the activation, which
/// the caller applies where the architecture needs it.
#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: FrozenBatchNorm<B>,
}

impl<B: Backend> ConvNorm<B> {
    /// Create a `kernel_size×kernel_size` conv with "same"-style padding.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        groups: usize,
        epsilon: f64,
        device: &B::Device,
    ) -> Self {
        let padding = (kernel_size - 1) / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device);
        let norm = FrozenBatchNorm::new(out_channels, epsilon, device);

        Self { conv, norm }
    }

    /// Output channel count.
    pub fn out_channels(&self) -> usize {
        self.norm.channels()
    }

    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(x))
    }
}
