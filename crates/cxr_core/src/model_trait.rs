//! Model traits for inference and explanation.
//!
//! The pipeline only needs two capabilities from a classifier: a forward pass
//! producing logits, and a feature stack that can be split at a named layer so
//! gradients can be taken with respect to that layer's activations.

use burn::prelude::*;

/// Trait for image classification models.
///
/// Inputs are normalized image batches of shape (batch, 3, height, width).
pub trait ImageClassifier<B: Backend>: Send {
    /// Forward pass returning logits of shape (batch, n_classes).
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Number of output classes.
    fn n_classes(&self) -> usize;

    /// Forward pass returning probabilities.
    fn forward_probs(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let logits = self.forward(x);
        burn::tensor::activation::softmax(logits, 1)
    }
}

/// A classifier whose convolutional feature stack is addressable by index.
///
/// Feature layer `i` is the `i`-th stage of the extraction stack. Splitting
/// the forward pass as `forward_head(forward_features(x, i), i)` must give the
/// same logits as [`ImageClassifier::forward`].
pub trait FeatureExtractor<B: Backend>: ImageClassifier<B> {
    /// Number of feature layers in the extraction stack.
    fn n_feature_layers(&self) -> usize;

    /// Run the stack up to and including feature layer `layer`.
    ///
    /// Returns `None` if the layer does not exist.
    fn forward_features(&self, x: Tensor<B, 4>, layer: usize) -> Option<Tensor<B, 4>>;

    /// Continue from the activations of feature layer `layer` to logits.
    ///
    /// Returns `None` if the layer does not exist.
    fn forward_head(&self, activations: Tensor<B, 4>, layer: usize) -> Option<Tensor<B, 2>>;
}
