//! Training samples and where they come from.
//!
//! Besides the in-memory source used by tests and the synthetic generators,
//! [`IdxDataSource`] reads the IDX format used by MNIST: a big-endian header
//! (`0x00000803` for images, `0x00000801` for labels) followed by raw bytes.

use std::fs;
use std::path::Path;

use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::error::{GraphError, Result};
use crate::ops::loss;
use crate::tensor::Tensor;

pub const IDX_IMAGES_MAGIC: u32 = 0x0000_0803;
pub const IDX_LABELS_MAGIC: u32 = 0x0000_0801;
pub const PIXEL_SCALE: f32 = 255.0;

/// One training example: an input vector and its one-hot label.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub input: Tensor,
    pub label: Tensor,
    class: usize,
}

impl Sample {
    pub fn new(input: Tensor, label: Tensor) -> Result<Self> {
        let class = loss::target_index(&label)?;
        Ok(Sample { input, label, class })
    }

    pub fn class(&self) -> usize {
        self.class
    }
}

pub trait DataSource {
    fn len(&self) -> usize;

    fn num_classes(&self) -> usize;

    fn sample(&self, index: usize) -> Result<Sample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn one_hot_encode(label: usize, classes: usize) -> Result<Tensor> {
    if label >= classes {
        return Err(GraphError::invalid_label(format!(
            "class {} out of range for {} classes",
            label, classes
        )));
    }
    let mut data = vec![0.0; classes];
    data[label] = 1.0;
    Ok(Tensor::vector(data))
}

/// Scales raw bytes into `[0, 1]` when `divisor` is the byte range.
pub fn normalize_input(raw: &[u8], divisor: f32) -> Tensor {
    Tensor::vector(raw.iter().map(|&b| b as f32 / divisor).collect())
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDataSource {
    samples: Vec<Sample>,
    classes: usize,
}

impl InMemoryDataSource {
    pub fn new(samples: Vec<Sample>, classes: usize) -> Result<Self> {
        for (i, sample) in samples.iter().enumerate() {
            if sample.label.len() != classes {
                return Err(GraphError::invalid_label(format!(
                    "sample {} has a label of length {}, expected {}",
                    i,
                    sample.label.len(),
                    classes
                )));
            }
        }
        Ok(InMemoryDataSource { samples, classes })
    }

    pub fn from_pairs(pairs: Vec<(Vec<f32>, usize)>, classes: usize) -> Result<Self> {
        let samples = pairs
            .into_iter()
            .map(|(input, class)| Sample::new(Tensor::vector(input), one_hot_encode(class, classes)?))
            .collect::<Result<Vec<_>>>()?;
        Self::new(samples, classes)
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

impl DataSource for InMemoryDataSource {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn num_classes(&self) -> usize {
        self.classes
    }

    fn sample(&self, index: usize) -> Result<Sample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or_else(|| GraphError::Data(format!("sample {} out of range ({} samples)", index, self.samples.len())))
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| GraphError::Data(format!("truncated IDX header at byte {}", offset)))
}

fn check_magic(bytes: &[u8], expected: u32, what: &str) -> Result<()> {
    let magic = read_u32(bytes, 0)?;
    if magic != expected {
        return Err(GraphError::Data(format!(
            "{} file has magic {:#010x}, expected {:#010x}",
            what, magic, expected
        )));
    }
    Ok(())
}

/// MNIST-style dataset backed by an IDX image file and an IDX label file.
#[derive(Debug, Clone)]
pub struct IdxDataSource {
    pixels: Vec<u8>,
    labels: Vec<u8>,
    rows: usize,
    cols: usize,
    classes: usize,
}

impl IdxDataSource {
    pub fn open(images: impl AsRef<Path>, labels: impl AsRef<Path>, classes: usize) -> Result<Self> {
        let source = Self::from_bytes(&fs::read(images.as_ref())?, &fs::read(labels.as_ref())?, classes)?;
        info!(
            "loaded {} samples of {}x{} from {}",
            source.len(),
            source.rows,
            source.cols,
            images.as_ref().display()
        );
        Ok(source)
    }

    pub fn from_bytes(images: &[u8], labels: &[u8], classes: usize) -> Result<Self> {
        check_magic(images, IDX_IMAGES_MAGIC, "image")?;
        check_magic(labels, IDX_LABELS_MAGIC, "label")?;

        let count = read_u32(images, 4)? as usize;
        let rows = read_u32(images, 8)? as usize;
        let cols = read_u32(images, 12)? as usize;
        let label_count = read_u32(labels, 4)? as usize;
        if count != label_count {
            return Err(GraphError::Data(format!(
                "{} images but {} labels",
                count, label_count
            )));
        }

        let pixel_end = count
            .checked_mul(rows)
            .and_then(|n| n.checked_mul(cols))
            .and_then(|n| n.checked_add(16))
            .ok_or_else(|| GraphError::Data(format!("image header {}x{}x{} is too large", count, rows, cols)))?;
        let pixels = images.get(16..pixel_end).ok_or_else(|| {
            GraphError::Data(format!("image file too short for {} images of {}x{}", count, rows, cols))
        })?;
        let label_end = count
            .checked_add(8)
            .ok_or_else(|| GraphError::Data(format!("label header count {} is too large", count)))?;
        let labels = labels
            .get(8..label_end)
            .ok_or_else(|| GraphError::Data(format!("label file too short for {} labels", count)))?;
        if let Some(bad) = labels.iter().find(|&&l| l as usize >= classes) {
            return Err(GraphError::invalid_label(format!(
                "label {} out of range for {} classes",
                bad, classes
            )));
        }

        Ok(IdxDataSource {
            pixels: pixels.to_vec(),
            labels: labels.to_vec(),
            rows,
            cols,
            classes,
        })
    }

    /// Keeps only the first `n` samples.
    pub fn truncate(&mut self, n: usize) {
        let n = n.min(self.labels.len());
        self.labels.truncate(n);
        self.pixels.truncate(n * self.input_dim());
    }

    pub fn input_dim(&self) -> usize {
        self.rows * self.cols
    }
}

impl DataSource for IdxDataSource {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn num_classes(&self) -> usize {
        self.classes
    }

    fn sample(&self, index: usize) -> Result<Sample> {
        let label = *self
            .labels
            .get(index)
            .ok_or_else(|| GraphError::Data(format!("sample {} out of range ({} samples)", index, self.labels.len())))?;
        let dim = self.input_dim();
        let raw = self
            .pixels
            .get(index * dim..(index + 1) * dim)
            .ok_or_else(|| GraphError::Data(format!("pixels of sample {} are missing", index)))?;
        Sample::new(normalize_input(raw, PIXEL_SCALE), one_hot_encode(label as usize, self.classes)?)
    }
}

/// Two linearly separable points, one per class.
pub fn two_point_dataset() -> InMemoryDataSource {
    InMemoryDataSource {
        samples: vec![
            Sample {
                input: Tensor::vector(vec![1.0, 0.0]),
                label: Tensor::vector(vec![1.0, 0.0]),
                class: 0,
            },
            Sample {
                input: Tensor::vector(vec![0.0, 1.0]),
                label: Tensor::vector(vec![0.0, 1.0]),
                class: 1,
            },
        ],
        classes: 2,
    }
}

/// `per_class` points around one random centre per class.
pub fn gaussian_blobs(classes: usize, per_class: usize, dim: usize, seed: u64) -> Result<InMemoryDataSource> {
    if classes == 0 || dim == 0 {
        return Err(GraphError::Data("blobs need at least one class and one dimension".to_string()));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let centres = Normal::new(0.0f32, 3.0).map_err(|e| GraphError::Data(e.to_string()))?;
    let spread = Normal::new(0.0f32, 0.5).map_err(|e| GraphError::Data(e.to_string()))?;

    let mut pairs = Vec::with_capacity(classes * per_class);
    for class in 0..classes {
        let centre: Vec<f32> = (0..dim).map(|_| centres.sample(&mut rng)).collect();
        for _ in 0..per_class {
            let point = centre.iter().map(|c| c + spread.sample(&mut rng)).collect();
            pairs.push((point, class));
        }
    }
    InMemoryDataSource::from_pairs(pairs, classes)
}
