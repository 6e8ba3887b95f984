//! Summation, ReLU and tanh kernels.

use crate::error::{GraphError, Result};
use crate::node::OperationKind;
use crate::tensor::{Shape, Tensor};

pub fn summation_shape(left: Shape, right: Shape) -> Result<Shape> {
    if left != right {
        return Err(GraphError::shape_mismatch(OperationKind::Summation, left, right));
    }
    Ok(left)
}

pub fn add(left: &Tensor, right: &Tensor) -> Result<Tensor> {
    left.zip_map(right, |a, b| a + b)
}

pub fn relu(x: &Tensor) -> Tensor {
    x.map(|v| if v > 0.0 { v } else { 0.0 })
}

/// Diagonal of the ReLU Jacobian, read off the forward output. The kink at
/// exactly zero gets derivative 0.
pub fn relu_derivative(output: &Tensor) -> Vec<f32> {
    output.data().iter().map(|&y| if y > 0.0 { 1.0 } else { 0.0 }).collect()
}

/// `tanh(x) = (1 - e^{-2x}) / (1 + e^{-2x})`, evaluated on `|x|` so the
/// exponential never overflows.
pub fn tanh_scalar(x: f32) -> f32 {
    let e = (-2.0 * x.abs()).exp();
    let t = (1.0 - e) / (1.0 + e);
    if x < 0.0 {
        -t
    } else {
        t
    }
}

pub fn tanh(x: &Tensor) -> Tensor {
    x.map(tanh_scalar)
}

pub fn tanh_derivative(output: &Tensor) -> Vec<f32> {
    output.data().iter().map(|&y| 1.0 - y * y).collect()
}

/// Applies a diagonal Jacobian: `grad_i = upstream_i * diagonal_i`.
pub fn apply_diagonal(upstream: &Tensor, diagonal: &[f32]) -> Result<Tensor> {
    if upstream.len() != diagonal.len() {
        return Err(GraphError::invalid_tensor(format!(
            "upstream gradient has {} elements, jacobian diagonal has {}",
            upstream.len(),
            diagonal.len()
        )));
    }
    let data = upstream.data().iter().zip(diagonal.iter()).map(|(g, d)| g * d).collect();
    Tensor::new(data, upstream.shape())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_summation_shape() {
        assert_eq!(summation_shape(Shape::vector(3), Shape::vector(3)).unwrap(), Shape::vector(3));
        assert!(matches!(
            summation_shape(Shape::vector(3), Shape::new(3, 1)),
            Err(GraphError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_relu_derivative_zero_at_kink() {
        let x = Tensor::vector(vec![-1.0, 0.0, 2.5]);
        let y = relu(&x);
        assert_eq!(y.data(), &[0.0, 0.0, 2.5]);
        assert_eq!(relu_derivative(&y), vec![0.0, 0.0, 1.0]);
    }

    #[rstest]
    #[case(0.0)]
    #[case(0.5)]
    #[case(-1.3)]
    #[case(3.0)]
    #[case(-60.0)]
    #[case(60.0)]
    fn test_tanh_matches_std(#[case] x: f32) {
        assert!((tanh_scalar(x) - x.tanh()).abs() < 1e-6);
    }

    #[test]
    fn test_apply_diagonal_length_check() {
        let up = Tensor::vector(vec![1.0, 2.0]);
        assert_eq!(apply_diagonal(&up, &[0.5, 0.0]).unwrap().data(), &[0.5, 0.0]);
        assert!(apply_diagonal(&up, &[1.0]).is_err());
    }
}
