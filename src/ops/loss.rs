//! Cross-entropy loss over logits.
//!
//! The loss is always evaluated from pre-softmax logits as
//! `log_sum_exp(z) - z_j`, where `j` is the hot index of the label. The
//! probabilities are a byproduct used for the gradient `p - y`.
//!
//! When the loss node sits on top of a softmax node, that gradient is handed
//! straight to the softmax input. This is the derived identity
//! `Jᵀ · (-y / p) = p - y`, valid because `Σ y = 1`; it is not a separate
//! formula, and it avoids dividing by probabilities that may underflow.

use crate::error::{GraphError, Result};
use crate::ops::softmax;
use crate::tensor::{Shape, Tensor};

#[derive(Debug, Clone, PartialEq)]
pub struct CrossEntropy {
    pub loss: f32,
    pub probabilities: Vec<f32>,
}

/// Returns the hot index of a one-hot label.
pub fn target_index(label: &Tensor) -> Result<usize> {
    if !label.shape().is_vector() {
        return Err(GraphError::invalid_label(format!("label must be a vector, got shape {}", label.shape())));
    }
    let mut hot = None;
    for (i, &v) in label.data().iter().enumerate() {
        if v == 1.0 {
            if hot.is_some() {
                return Err(GraphError::invalid_label("label has more than one hot entry"));
            }
            hot = Some(i);
        } else if v != 0.0 {
            return Err(GraphError::invalid_label(format!("label entry {} is {}, expected 0 or 1", i, v)));
        }
    }
    hot.ok_or_else(|| GraphError::invalid_label("label has no hot entry"))
}

/// Validates a label against the loss input and returns its hot index.
pub fn validate(input: Shape, label: &Tensor) -> Result<usize> {
    if input.numel() != label.len() {
        return Err(GraphError::invalid_label(format!(
            "label has {} entries but the loss input has {}",
            label.len(),
            input.numel()
        )));
    }
    target_index(label)
}

pub fn forward(logits: &[f32], target: usize) -> CrossEntropy {
    let loss = softmax::log_sum_exp(logits) - logits[target];
    CrossEntropy {
        loss,
        probabilities: softmax::forward(logits),
    }
}

/// Gradient of the loss with respect to the logits: `p - y`.
pub fn logits_gradient(probabilities: &[f32], target: usize) -> Vec<f32> {
    probabilities
        .iter()
        .enumerate()
        .map(|(i, p)| if i == target { p - 1.0 } else { *p })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(vec![0.0, 1.0, 0.0], 1)]
    #[case(vec![1.0], 0)]
    fn test_target_index(#[case] label: Vec<f32>, #[case] expected: usize) {
        assert_eq!(target_index(&Tensor::vector(label)).unwrap(), expected);
    }

    #[rstest]
    #[case(vec![0.0, 0.0, 0.0])]
    #[case(vec![1.0, 1.0, 0.0])]
    #[case(vec![0.5, 0.5, 0.0])]
    fn test_target_index_rejects_non_one_hot(#[case] label: Vec<f32>) {
        assert!(matches!(target_index(&Tensor::vector(label)), Err(GraphError::InvalidLabel { .. })));
    }

    #[test]
    fn test_validate_length() {
        let label = Tensor::vector(vec![1.0, 0.0]);
        assert!(matches!(validate(Shape::vector(3), &label), Err(GraphError::InvalidLabel { .. })));
        assert_eq!(validate(Shape::vector(2), &label).unwrap(), 0);
    }

    #[test]
    fn test_hand_computed_example() {
        let ce = forward(&[2.0, 1.0, 0.0], 0);
        assert!((ce.loss - 0.4076).abs() < 1e-4);
        let grad = logits_gradient(&ce.probabilities, 0);
        let expected = [-0.3348, 0.2447, 0.0900];
        for (a, b) in grad.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_logit_and_probability_formulations_agree() {
        let logits = [0.4, -2.0, 3.1, 0.0];
        let ce = forward(&logits, 2);
        let from_probabilities = -ce.probabilities[2].ln();
        assert!((ce.loss - from_probabilities).abs() < 1e-5);
    }

    #[test]
    fn test_large_logits_stay_finite() {
        let ce = forward(&[1e4, -1e4, 0.0], 1);
        assert!(ce.loss.is_finite());
        assert!((ce.loss - 2e4).abs() < 1.0);
    }
}
