//! Forward evaluation to a class distribution.

use burn::prelude::*;
use cxr_core::ImageClassifier;
use cxr_transforms::NormalizedInput;
use serde::{Deserialize, Serialize};

use crate::error::{InferError, Result};

/// Outcome of classifying one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Label of the most probable class.
    pub label: String,
    /// Index of the most probable class.
    pub class_index: usize,
    /// Probability of the most probable class.
    pub probability: f32,
    /// Softmax distribution in label order.
    pub distribution: Vec<f32>,
}

impl PredictionResult {
    /// Build from a probability distribution.
    ///
    /// Ties resolve to the lowest index.
    pub fn from_distribution(distribution: Vec<f32>, labels: &[String]) -> Result<Self> {
        if distribution.len() != labels.len() {
            return Err(InferError::Backend(format!(
                "classifier produced {} scores for {} labels",
                distribution.len(),
                labels.len()
            )));
        }
        if distribution.iter().any(|p| !p.is_finite()) {
            return Err(InferError::Backend(
                "classifier produced non-finite scores".to_string(),
            ));
        }
        let class_index = argmax(&distribution)
            .ok_or_else(|| InferError::Backend("empty distribution".to_string()))?;

        Ok(Self {
            label: labels[class_index].clone(),
            class_index,
            probability: distribution[class_index],
            distribution,
        })
    }
}

/// Index of the first maximum.
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (idx, &v)| match best {
            Some((_, current)) if v <= current => best,
            _ => Some((idx, v)),
        })
        .map(|(idx, _)| idx)
}

/// Classify a preprocessed input.
pub fn classify<B, M>(
    model: &M,
    labels: &[String],
    input: &NormalizedInput,
    device: &B::Device,
) -> Result<PredictionResult>
where
    B: Backend,
    M: ImageClassifier<B>,
{
    let x = input.to_tensor::<B>(device);
    let probs = model.forward_probs(x);
    let distribution = probs
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| InferError::Backend(format!("{:?}", e)))?;

    PredictionResult::from_distribution(distribution, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    /// Logits are the per-channel means of the input.
    struct ChannelMean;

    impl<B: Backend> ImageClassifier<B> for ChannelMean {
        fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
            let [batch, channels, _, _] = x.dims();
            x.mean_dim(3).mean_dim(2).reshape([batch, channels])
        }

        fn n_classes(&self) -> usize {
            3
        }
    }

    fn labels() -> Vec<String> {
        vec!["A".into(), "B".into(), "C".into()]
    }

    #[test]
    fn test_argmax_first_on_ties() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), Some(1));
        assert_eq!(argmax(&[0.9]), Some(0));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_classify_picks_strongest_channel() {
        let mut data = vec![0.0f32; 3 * 4 * 4];
        data[32..].iter_mut().for_each(|v| *v = 2.0);
        let input = NormalizedInput::from_vec(data, 4).unwrap();

        let result =
            classify::<TestBackend, _>(&ChannelMean, &labels(), &input, &Default::default())
                .unwrap();

        assert_eq!(result.label, "C");
        assert_eq!(result.class_index, 2);
        assert_eq!(result.distribution.len(), 3);
        let sum: f32 = result.distribution.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        let max = result.distribution.iter().cloned().fold(f32::MIN, f32::max);
        assert_eq!(result.probability, max);
    }

    #[test]
    fn test_uniform_input_is_uniform_distribution() {
        let input = NormalizedInput::from_vec(vec![0.0; 3 * 2 * 2], 2).unwrap();
        let result =
            classify::<TestBackend, _>(&ChannelMean, &labels(), &input, &Default::default())
                .unwrap();

        assert_eq!(result.class_index, 0);
        for p in &result.distribution {
            assert!((p - 1.0 / 3.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_label_count_mismatch() {
        let result = PredictionResult::from_distribution(vec![0.5, 0.5], &labels());
        assert!(matches!(result, Err(InferError::Backend(_))));
    }
}
