//! Primitive layers: affine maps, activations, dropout and the top-K
//! sparsifier. Forwards return whatever the backward pass needs as an
//! explicit cache value instead of stashing state on the layer.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use aegis_core::{AegisError, Result};

/// Whether stochastic layers sample. `Standard` is the deterministic
/// inference path; `Stochastic` keeps dropout live, which both training and
/// the post-softmax ensemble rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Standard,
    Stochastic,
}

/// Fully connected layer. Weights are stored `(out, in)` so a forward pass
/// is `x · wᵀ + b`.
#[derive(Debug, Clone)]
pub struct Dense {
    pub w: Array2<f32>,
    pub b: Array1<f32>,
}

impl Dense {
    /// He-style initialization, scaled by the fan-in.
    pub fn new_random(in_dim: usize, out_dim: usize, rng: &mut StdRng) -> Result<Self> {
        if in_dim == 0 || out_dim == 0 {
            return Err(AegisError::InvalidArgument(
                "dense layer dimensions must be nonzero".into(),
            ));
        }
        let std = (2.0 / in_dim as f32).sqrt();
        let normal = Normal::new(0.0, std)
            .map_err(|e| AegisError::InvalidArgument(format!("bad init distribution: {e}")))?;
        let w = Array2::from_shape_fn((out_dim, in_dim), |_| normal.sample(rng));
        Ok(Self {
            w,
            b: Array1::zeros(out_dim),
        })
    }

    pub fn from_parts(w: Array2<f32>, b: Array1<f32>) -> Result<Self> {
        if w.nrows() != b.len() {
            return Err(AegisError::ShapeMismatch {
                expected: vec![w.nrows()],
                got: vec![b.len()],
            });
        }
        Ok(Self { w, b })
    }

    pub fn in_dim(&self) -> usize {
        self.w.ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.w.nrows()
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.w.t()) + &self.b
    }

    /// Gradients for one affine layer. `x` is the input the forward saw,
    /// `grad_out` the gradient at its output. Returns `(grad_in, dw, db)`.
    pub fn backward(
        &self,
        x: &Array2<f32>,
        grad_out: &Array2<f32>,
    ) -> (Array2<f32>, Array2<f32>, Array1<f32>) {
        let grad_in = grad_out.dot(&self.w);
        let dw = grad_out.t().dot(x);
        let db = grad_out.sum_axis(Axis(0));
        (grad_in, dw, db)
    }
}

pub fn relu_forward(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| v.max(0.0))
}

/// Backward through ReLU given the forward *input*.
pub fn relu_backward(x: &Array2<f32>, grad_out: &Array2<f32>) -> Array2<f32> {
    let mut g = grad_out.clone();
    g.zip_mut_with(x, |gv, &xv| {
        if xv <= 0.0 {
            *gv = 0.0;
        }
    });
    g
}

pub fn sigmoid_forward(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

/// Backward through sigmoid given the forward *output*.
pub fn sigmoid_backward(y: &Array2<f32>, grad_out: &Array2<f32>) -> Array2<f32> {
    let mut g = grad_out.clone();
    g.zip_mut_with(y, |gv, &yv| *gv *= yv * (1.0 - yv));
    g
}

/// Inverted dropout: kept units are scaled by `1/(1-p)` so the expected
/// activation matches the deterministic path. Returns the output and the
/// scaled keep-mask the backward pass multiplies by. In `Standard` mode the
/// mask is all ones.
pub fn dropout_forward(
    x: &Array2<f32>,
    p: f32,
    mode: Mode,
    rng: &mut StdRng,
) -> (Array2<f32>, Array2<f32>) {
    if mode == Mode::Standard || p <= 0.0 {
        return (x.clone(), Array2::ones(x.raw_dim()));
    }
    let keep = 1.0 - p;
    let mask = Array2::from_shape_fn(x.raw_dim(), |_| {
        if rng.random::<f32>() < keep {
            1.0 / keep
        } else {
            0.0
        }
    });
    (x * &mask, mask)
}

pub fn dropout_backward(mask: &Array2<f32>, grad_out: &Array2<f32>) -> Array2<f32> {
    grad_out * mask
}

/// Keep the `k` largest-magnitude entries of each row and zero the rest.
/// Returns the sparsified output together with the binary keep-mask.
pub fn topk_forward(x: &Array2<f32>, k: usize) -> (Array2<f32>, Array2<f32>) {
    let n = x.ncols();
    if k >= n {
        return (x.clone(), Array2::ones(x.raw_dim()));
    }
    let mut out = x.clone();
    let mut mask = Array2::zeros(x.raw_dim());
    let mut idx: Vec<usize> = Vec::with_capacity(n);
    for (mut out_row, (row, mut mask_row)) in out
        .rows_mut()
        .into_iter()
        .zip(x.rows().into_iter().zip(mask.rows_mut()))
    {
        idx.clear();
        idx.extend(0..n);
        idx.sort_unstable_by(|&a, &b| {
            row[b]
                .abs()
                .partial_cmp(&row[a].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for &dead in &idx[k..] {
            out_row[dead] = 0.0;
        }
        for &live in &idx[..k] {
            mask_row[live] = 1.0;
        }
    }
    (out, mask)
}

/// Backward through the top-K sparsifier: pass gradient only where the
/// forward kept a unit, like maxpool does.
pub fn topk_backward(mask: &Array2<f32>, grad_out: &Array2<f32>) -> Array2<f32> {
    grad_out * mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_dense_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(7);
        let layer = Dense::new_random(4, 3, &mut rng).unwrap();
        let x = Array2::from_shape_fn((2, 4), |_| rng.random::<f32>() - 0.5);
        let grad_out = Array2::ones((2, 3));

        let (grad_in, _, _) = layer.backward(&x, &grad_out);

        let eps = 1e-3_f32;
        for i in 0..2 {
            for j in 0..4 {
                let mut xp = x.clone();
                xp[[i, j]] += eps;
                let mut xm = x.clone();
                xm[[i, j]] -= eps;
                let fp = layer.forward(&xp).sum();
                let fm = layer.forward(&xm).sum();
                let numeric = (fp - fm) / (2.0 * eps);
                assert!(
                    (grad_in[[i, j]] - numeric).abs() < 1e-2,
                    "analytic {} vs numeric {}",
                    grad_in[[i, j]],
                    numeric
                );
            }
        }
    }

    #[test]
    fn test_topk_keeps_largest_magnitudes() {
        let x = array![[1.0_f32, -5.0, 0.5, 3.0]];
        let (y, mask) = topk_forward(&x, 2);
        assert_eq!(y, array![[0.0, -5.0, 0.0, 3.0]]);
        assert_eq!(mask, array![[0.0, 1.0, 0.0, 1.0]]);
    }

    #[test]
    fn test_topk_with_k_at_least_width_is_identity() {
        let x = array![[1.0_f32, 2.0], [3.0, 4.0]];
        let (y, mask) = topk_forward(&x, 2);
        assert_eq!(y, x);
        assert_eq!(mask.sum(), 4.0);
    }

    #[test]
    fn test_dropout_standard_mode_is_identity() {
        let mut rng = StdRng::seed_from_u64(0);
        let x = Array2::from_elem((3, 5), 2.0_f32);
        let (y, mask) = dropout_forward(&x, 0.5, Mode::Standard, &mut rng);
        assert_eq!(y, x);
        assert_eq!(mask.sum(), 15.0);
    }

    #[test]
    fn test_dropout_preserves_expectation_roughly() {
        let mut rng = StdRng::seed_from_u64(11);
        let x = Array2::from_elem((200, 50), 1.0_f32);
        let (y, _) = dropout_forward(&x, 0.5, Mode::Stochastic, &mut rng);
        let mean = y.sum() / (200.0 * 50.0);
        assert!((mean - 1.0).abs() < 0.05, "mean after dropout: {mean}");
    }
}
