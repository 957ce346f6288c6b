//! In-memory dataset plus batching.

use std::path::Path;
use std::str::FromStr;

use ndarray::{s, Array2, Array4, Axis};

use aegis_core::{AegisError, ChannelOrder, Result};
use aegis_patch::ImageBatch;

use crate::cifar::{load_cifar10, Cifar10Split};
use crate::synthetic::synthetic_dataset;

/// Closed set of dataset sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Cifar10,
    Synthetic,
}

impl FromStr for DatasetKind {
    type Err = AegisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cifar10" => Ok(DatasetKind::Cifar10),
            "synthetic" => Ok(DatasetKind::Synthetic),
            other => Err(AegisError::UnsupportedConfig(format!(
                "dataset not understood: {other}"
            ))),
        }
    }
}

impl DatasetKind {
    pub fn name(&self) -> &'static str {
        match self {
            DatasetKind::Cifar10 => "cifar10",
            DatasetKind::Synthetic => "synthetic",
        }
    }

    /// Load the given split. `root` points at the CIFAR-10 binary directory
    /// and is ignored for synthetic data, which is generated from `seed`.
    pub fn load(&self, root: &Path, split: Cifar10Split, seed: u64) -> Result<Dataset> {
        match self {
            DatasetKind::Cifar10 => load_cifar10(root, split),
            DatasetKind::Synthetic => {
                let n = match split {
                    Cifar10Split::Train => 512,
                    Cifar10Split::Test => 128,
                };
                synthetic_dataset(n, (3, 32, 32), 10, seed)
            }
        }
    }
}

/// Labeled images, NCHW, pixels in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub images: Array4<f32>,
    pub labels: Vec<usize>,
}

impl Dataset {
    pub fn new(images: Array4<f32>, labels: Vec<usize>) -> Result<Self> {
        if images.shape()[0] != labels.len() {
            return Err(AegisError::ShapeMismatch {
                expected: vec![images.shape()[0]],
                got: vec![labels.len()],
            });
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// `(channels, height, width)` of one image.
    pub fn image_dims(&self) -> (usize, usize, usize) {
        let s = self.images.shape();
        (s[1], s[2], s[3])
    }

    pub fn feature_len(&self) -> usize {
        let (c, h, w) = self.image_dims();
        c * h * w
    }

    /// All images flattened to `(n, c*h*w)`.
    pub fn flatten(&self) -> Array2<f32> {
        let n = self.len();
        let d = self.feature_len();
        // logical iteration order is n-major, so this is the CHW flattening
        let data: Vec<f32> = self.images.iter().copied().collect();
        Array2::from_shape_vec((n, d), data).expect("element count matches dims")
    }

    /// Wrap as an `ImageBatch` for patch extraction.
    pub fn image_batch(&self) -> ImageBatch {
        ImageBatch::new(self.images.clone(), ChannelOrder::Nchw)
    }

    /// Keep only the first `n` images.
    pub fn truncate(&self, n: usize) -> Dataset {
        let n = n.min(self.len());
        Dataset {
            images: self.images.slice(s![..n, .., .., ..]).to_owned(),
            labels: self.labels[..n].to_vec(),
        }
    }

    /// Flattened batches of at most `batch_size` images with their labels.
    /// The final batch may be short.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = (Array2<f32>, Vec<usize>)> + '_ {
        let flat = self.flatten();
        let labels = self.labels.clone();
        let n = self.len();
        let bs = batch_size.max(1);
        let n_batches = n.div_ceil(bs);
        (0..n_batches).map(move |b| {
            let lo = b * bs;
            let hi = ((b + 1) * bs).min(n);
            (
                flat.slice_axis(Axis(0), (lo..hi).into()).to_owned(),
                labels[lo..hi].to_vec(),
            )
        })
    }
}
