use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Row/column extent of a tensor. Vectors are `(1, n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
}

impl Shape {
    pub fn new(rows: usize, cols: usize) -> Self {
        Shape { rows, cols }
    }

    pub fn vector(len: usize) -> Self {
        Shape { rows: 1, cols: len }
    }

    pub fn scalar() -> Self {
        Shape { rows: 1, cols: 1 }
    }

    pub fn numel(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_vector(&self) -> bool {
        self.rows == 1
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.rows, self.cols)
    }
}

impl From<(usize, usize)> for Shape {
    fn from((rows, cols): (usize, usize)) -> Self {
        Shape { rows, cols }
    }
}

/// Row-major `f32` buffer with a 2-D shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Shape,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(data: Vec<f32>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if shape.numel() != data.len() {
            return Err(GraphError::invalid_tensor(format!(
                "data/shape mismatch: shape {} expects {} elements, got {}",
                shape,
                shape.numel(),
                data.len()
            )));
        }
        Ok(Tensor { shape, data })
    }

    pub fn vector(data: Vec<f32>) -> Self {
        Tensor {
            shape: Shape::vector(data.len()),
            data,
        }
    }

    pub fn scalar(value: f32) -> Self {
        Tensor {
            shape: Shape::scalar(),
            data: vec![value],
        }
    }

    /// Builds a matrix from equally sized rows.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(GraphError::invalid_tensor("rows have different lengths"));
        }
        let data = rows.iter().flatten().copied().collect();
        Tensor::new(data, Shape::new(rows.len(), cols))
    }

    pub fn zeros(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        Tensor {
            data: vec![0.0; shape.numel()],
            shape,
        }
    }

    pub fn zeros_like(&self) -> Self {
        Tensor::zeros(self.shape)
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn rows(&self) -> usize {
        self.shape.rows
    }

    pub fn cols(&self) -> usize {
        self.shape.cols
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.shape.cols + col]
    }

    pub fn row(&self, row: usize) -> &[f32] {
        let start = row * self.shape.cols;
        &self.data[start..start + self.shape.cols]
    }

    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32,
    {
        Tensor {
            shape: self.shape,
            data: self.data.iter().map(|x| f(*x)).collect(),
        }
    }

    pub fn zip_map<F>(&self, other: &Tensor, f: F) -> Result<Tensor>
    where
        F: Fn(f32, f32) -> f32,
    {
        if self.len() != other.len() {
            return Err(GraphError::invalid_tensor(format!(
                "elementwise operands have {} and {} elements",
                self.len(),
                other.len()
            )));
        }
        let data = self.data.iter().zip(other.data.iter()).map(|(a, b)| f(*a, *b)).collect();
        Ok(Tensor { shape: self.shape, data })
    }

    /// Elementwise `self += other`; shapes are compared by element count.
    pub fn add_assign(&mut self, other: &Tensor) -> Result<()> {
        if self.len() != other.len() {
            return Err(GraphError::invalid_tensor(format!(
                "cannot accumulate {} elements into {}",
                other.len(),
                self.len()
            )));
        }
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
        Ok(())
    }

    pub fn scale(&mut self, factor: f32) {
        for v in &mut self.data {
            *v *= factor;
        }
    }

    pub fn fill(&mut self, value: f32) {
        for v in &mut self.data {
            *v = value;
        }
    }

    /// Index of the largest element; ties resolve to the first occurrence.
    pub fn argmax(&self) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (i, &v) in self.data.iter().enumerate() {
            match best {
                Some((_, b)) if v <= b => {}
                _ => best = Some((i, v)),
            }
        }
        best.map(|(i, _)| i)
    }

    pub fn max(&self) -> Option<f32> {
        self.data.iter().copied().fold(None, |acc, v| match acc {
            Some(m) if m >= v => Some(m),
            _ => Some(v),
        })
    }

    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }
}
