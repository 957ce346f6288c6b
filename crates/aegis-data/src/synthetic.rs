//! Seeded synthetic data for tests and smoke runs: Gaussian blobs around a
//! per-class mean image, clipped to `[0, 1]`.

use ndarray::{Array3, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use aegis_core::{AegisError, Result};

use crate::dataset::Dataset;

/// Generate `n_images` labeled images of shape `(c, h, w)` across
/// `n_classes` classes. The same seed always produces the same dataset.
pub fn synthetic_dataset(
    n_images: usize,
    dims: (usize, usize, usize),
    n_classes: usize,
    seed: u64,
) -> Result<Dataset> {
    let (c, h, w) = dims;
    if n_images == 0 || n_classes == 0 || c == 0 || h == 0 || w == 0 {
        return Err(AegisError::InvalidArgument(
            "synthetic dataset dimensions must be nonzero".into(),
        ));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0_f32, 0.08)
        .map_err(|e| AegisError::InvalidArgument(format!("bad noise distribution: {e}")))?;

    // one smooth mean image per class, kept away from the pixel-range edges
    let means: Vec<Array3<f32>> = (0..n_classes)
        .map(|_| Array3::from_shape_fn((c, h, w), |_| 0.2 + 0.6 * rng.random::<f32>()))
        .collect();

    let mut images = Array4::zeros((n_images, c, h, w));
    let mut labels = Vec::with_capacity(n_images);
    for i in 0..n_images {
        let class = rng.random_range(0..n_classes);
        labels.push(class);
        let mut view = images.index_axis_mut(ndarray::Axis(0), i);
        view.assign(&means[class]);
        view.mapv_inplace(|v| (v + noise.sample(&mut rng)).clamp(0.0, 1.0));
    }
    Dataset::new(images, labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_data() {
        let a = synthetic_dataset(20, (3, 8, 8), 4, 99).unwrap();
        let b = synthetic_dataset(20, (3, 8, 8), 4, 99).unwrap();
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.images, b.images);
    }

    #[test]
    fn test_pixels_stay_in_range() {
        let ds = synthetic_dataset(50, (1, 6, 6), 3, 1).unwrap();
        assert!(ds.images.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_labels_stay_in_range() {
        let ds = synthetic_dataset(50, (1, 4, 4), 5, 2).unwrap();
        assert!(ds.labels.iter().all(|&l| l < 5));
    }

    #[test]
    fn test_zero_images_is_rejected() {
        assert!(synthetic_dataset(0, (1, 4, 4), 2, 0).is_err());
    }
}
