//! Weight-matrix × activation-vector contraction.
//!
//! `W` has shape `(m, n)` and `x` has shape `(1, n)`. When the row counts
//! differ the node is a matrix-vector product with output `(1, m)`; when both
//! operands are `(1, n)` vectors it is their inner product with output
//! `(1, 1)`. Both cases share one kernel: `out_i = Σ_j W_ij x_j`.

use crate::error::{GraphError, Result};
use crate::node::OperationKind;
use crate::tensor::{Shape, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductMode {
    MatrixVector,
    InnerProduct,
}

pub fn output_shape(w: Shape, x: Shape) -> Result<(Shape, ProductMode)> {
    let mismatch = || GraphError::shape_mismatch(OperationKind::Product, w, x);
    if w.cols != x.cols || !x.is_vector() {
        return Err(mismatch());
    }
    if w.rows != x.rows {
        Ok((Shape::vector(w.rows), ProductMode::MatrixVector))
    } else {
        Ok((Shape::scalar(), ProductMode::InnerProduct))
    }
}

pub fn forward(w: &Tensor, x: &Tensor) -> Tensor {
    let out = (0..w.rows())
        .map(|i| w.row(i).iter().zip(x.data().iter()).map(|(a, b)| a * b).sum())
        .collect();
    Tensor::vector(out)
}

/// Returns `(grad_w, grad_x)` for the given upstream gradient `g` of length
/// `rows(W)`:
///
/// - `grad_x_j = Σ_i g_i W_ij` (that is `Wᵀ g`)
/// - `grad_W_ij = g_i x_j`, the outer product flattened row-major
pub fn backward(w: &Tensor, x: &Tensor, upstream: &Tensor) -> Result<(Tensor, Tensor)> {
    let (rows, cols) = (w.rows(), w.cols());
    if upstream.len() != rows {
        return Err(GraphError::invalid_tensor(format!(
            "product upstream gradient has {} elements, expected {}",
            upstream.len(),
            rows
        )));
    }
    let g = upstream.data();

    let mut grad_x = vec![0.0; cols];
    for (i, gi) in g.iter().enumerate() {
        for (j, wij) in w.row(i).iter().enumerate() {
            grad_x[j] += gi * wij;
        }
    }

    let mut grad_w = Vec::with_capacity(rows * cols);
    for gi in g {
        grad_w.extend(x.data().iter().map(|xj| gi * xj));
    }

    Ok((Tensor::new(grad_w, w.shape())?, Tensor::new(grad_x, x.shape())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Shape::new(3, 4), Shape::vector(4), Shape::vector(3), ProductMode::MatrixVector)]
    #[case(Shape::vector(4), Shape::vector(4), Shape::scalar(), ProductMode::InnerProduct)]
    fn test_output_shape(#[case] w: Shape, #[case] x: Shape, #[case] out: Shape, #[case] mode: ProductMode) {
        assert_eq!(output_shape(w, x).unwrap(), (out, mode));
    }

    #[rstest]
    #[case(Shape::new(3, 4), Shape::vector(3))]
    #[case(Shape::new(3, 4), Shape::new(2, 4))]
    #[case(Shape::new(2, 4), Shape::new(2, 4))]
    fn test_output_shape_mismatch(#[case] w: Shape, #[case] x: Shape) {
        assert!(matches!(output_shape(w, x), Err(GraphError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_matrix_vector_forward_backward() {
        let w = Tensor::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        let x = Tensor::vector(vec![1.0, 0.0, -1.0]);
        assert_eq!(forward(&w, &x).data(), &[-2.0, -2.0]);

        let g = Tensor::vector(vec![1.0, 2.0]);
        let (gw, gx) = backward(&w, &x, &g).unwrap();
        assert_eq!(gx.data(), &[9.0, 12.0, 15.0]);
        assert_eq!(gw.shape(), Shape::new(2, 3));
        assert_eq!(gw.data(), &[1.0, 0.0, -1.0, 2.0, 0.0, -2.0]);
    }

    #[test]
    fn test_inner_product() {
        let u = Tensor::vector(vec![1.0, 2.0, 3.0]);
        let v = Tensor::vector(vec![4.0, 5.0, 6.0]);
        assert_eq!(forward(&u, &v).data(), &[32.0]);
        let (gu, gv) = backward(&u, &v, &Tensor::scalar(2.0)).unwrap();
        assert_eq!(gu.data(), &[8.0, 10.0, 12.0]);
        assert_eq!(gv.data(), &[2.0, 4.0, 6.0]);
    }
}
