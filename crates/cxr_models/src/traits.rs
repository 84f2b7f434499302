//! Trait implementations for inference and explanation.
//!
//! Implements the `cxr_core` model traits for the CNN classifiers.

use burn::prelude::*;
use cxr_core::{FeatureExtractor, ImageClassifier};

use crate::cnn::EfficientNet;

impl<B: Backend> ImageClassifier<B> for EfficientNet<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(x)
    }

    fn n_classes(&self) -> usize {
        self.classifier_outputs()
    }
}

impl<B: Backend> FeatureExtractor<B> for EfficientNet<B> {
    fn n_feature_layers(&self) -> usize {
        self.n_feature_layers()
    }

    fn forward_features(&self, x: Tensor<B, 4>, layer: usize) -> Option<Tensor<B, 4>> {
        self.forward_features(x, layer)
    }

    fn forward_head(&self, activations: Tensor<B, 4>, layer: usize) -> Option<Tensor<B, 2>> {
        self.forward_head(activations, layer)
    }
}
