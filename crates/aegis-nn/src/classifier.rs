//! Fully connected classifier: dense layers with ReLU between them and
//! optional dropout after each hidden activation. The cached forward keeps
//! per-layer inputs so the backward pass can produce input gradients for
//! attack steering.

use ndarray::Array2;
use rand::rngs::StdRng;

use aegis_core::{AegisError, Result};

use crate::layers::{self, Dense, Mode};
use crate::loss::{self, Loss};

#[derive(Debug, Clone)]
pub struct Classifier {
    layers: Vec<Dense>,
    dropout: Option<f32>,
}

/// Per-layer state from one cached forward.
pub struct ClfCache {
    /// Input to each dense layer.
    inputs: Vec<Array2<f32>>,
    /// Pre-activation output of each hidden layer.
    pre_acts: Vec<Array2<f32>>,
    /// Scaled dropout keep-mask after each hidden activation.
    drop_masks: Vec<Array2<f32>>,
}

impl Classifier {
    /// `dims` lists layer widths input-first, e.g. `[3072, 512, 256, 10]`.
    pub fn new(dims: &[usize], dropout: Option<f32>, rng: &mut StdRng) -> Result<Self> {
        if dims.len() < 2 {
            return Err(AegisError::InvalidArgument(
                "classifier needs at least an input and an output width".into(),
            ));
        }
        if let Some(p) = dropout {
            if !(0.0..1.0).contains(&p) {
                return Err(AegisError::InvalidArgument(format!(
                    "dropout probability must be in [0, 1), got {p}"
                )));
            }
        }
        let mut dense = Vec::with_capacity(dims.len() - 1);
        for pair in dims.windows(2) {
            dense.push(Dense::new_random(pair[0], pair[1], rng)?);
        }
        Ok(Self {
            layers: dense,
            dropout,
        })
    }

    pub fn from_layers(layers: Vec<Dense>, dropout: Option<f32>) -> Result<Self> {
        if layers.is_empty() {
            return Err(AegisError::InvalidArgument("empty layer list".into()));
        }
        for pair in layers.windows(2) {
            if pair[0].out_dim() != pair[1].in_dim() {
                return Err(AegisError::ShapeMismatch {
                    expected: vec![pair[0].out_dim()],
                    got: vec![pair[1].in_dim()],
                });
            }
        }
        Ok(Self { layers, dropout })
    }

    pub fn input_dim(&self) -> usize {
        self.layers[0].in_dim()
    }

    pub fn num_classes(&self) -> usize {
        self.layers[self.layers.len() - 1].out_dim()
    }

    pub fn dense_layers(&self) -> &[Dense] {
        &self.layers
    }

    pub fn has_stochastic_layer(&self) -> bool {
        self.dropout.is_some()
    }

    pub fn dropout_p(&self) -> Option<f32> {
        self.dropout
    }

    pub fn logits(&self, x: &Array2<f32>, mode: Mode, rng: &mut StdRng) -> Result<Array2<f32>> {
        Ok(self.logits_cached(x, mode, rng)?.0)
    }

    pub fn logits_cached(
        &self,
        x: &Array2<f32>,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<(Array2<f32>, ClfCache)> {
        if x.ncols() != self.input_dim() {
            return Err(AegisError::ShapeMismatch {
                expected: vec![self.input_dim()],
                got: vec![x.ncols()],
            });
        }
        let n_hidden = self.layers.len() - 1;
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut pre_acts = Vec::with_capacity(n_hidden);
        let mut drop_masks = Vec::with_capacity(n_hidden);

        let mut h = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            inputs.push(h.clone());
            let pre = layer.forward(&h);
            if i < n_hidden {
                let act = layers::relu_forward(&pre);
                let (dropped, mask) =
                    layers::dropout_forward(&act, self.dropout.unwrap_or(0.0), mode, rng);
                pre_acts.push(pre);
                drop_masks.push(mask);
                h = dropped;
            } else {
                h = pre;
            }
        }
        Ok((
            h,
            ClfCache {
                inputs,
                pre_acts,
                drop_masks,
            },
        ))
    }

    /// Gradient at the classifier input given a gradient at the logits.
    pub fn backward_input(&self, cache: &ClfCache, grad_logits: &Array2<f32>) -> Array2<f32> {
        let mut grad = grad_logits.clone();
        for (i, layer) in self.layers.iter().enumerate().rev() {
            if i < self.layers.len() - 1 {
                grad = layers::dropout_backward(&cache.drop_masks[i], &grad);
                grad = layers::relu_backward(&cache.pre_acts[i], &grad);
            }
            let (g_in, _, _) = layer.backward(&cache.inputs[i], &grad);
            grad = g_in;
        }
        grad
    }

    /// Input gradient of a loss evaluated at this classifier's logits.
    pub fn input_gradient(
        &self,
        x: &Array2<f32>,
        targets: &[usize],
        loss: Loss,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<Array2<f32>> {
        let (logits, cache) = self.logits_cached(x, mode, rng)?;
        let (_, grad_logits) = loss::loss_grad(loss, &logits, targets)?;
        Ok(self.backward_input(&cache, &grad_logits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_logits_have_one_row_per_image() {
        let mut rng = StdRng::seed_from_u64(1);
        let clf = Classifier::new(&[8, 16, 4], None, &mut rng).unwrap();
        let x = Array2::from_shape_fn((5, 8), |_| rng.random::<f32>());
        let z = clf.logits(&x, Mode::Standard, &mut rng).unwrap();
        assert_eq!(z.dim(), (5, 4));
    }

    #[test]
    fn test_input_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(5);
        let clf = Classifier::new(&[6, 12, 3], None, &mut rng).unwrap();
        let x = Array2::from_shape_fn((2, 6), |_| rng.random::<f32>() - 0.5);
        let targets = vec![0, 2];

        let grad = clf
            .input_gradient(&x, &targets, Loss::CrossEntropy, Mode::Standard, &mut rng)
            .unwrap();

        let eps = 1e-3_f32;
        for i in 0..2 {
            for j in 0..6 {
                let mut xp = x.clone();
                xp[[i, j]] += eps;
                let mut xm = x.clone();
                xm[[i, j]] -= eps;
                let zp = clf.logits(&xp, Mode::Standard, &mut rng).unwrap();
                let zm = clf.logits(&xm, Mode::Standard, &mut rng).unwrap();
                let (fp, _) = crate::loss::cross_entropy_loss_grad(&zp, &targets).unwrap();
                let (fm, _) = crate::loss::cross_entropy_loss_grad(&zm, &targets).unwrap();
                let numeric = (fp - fm) / (2.0 * eps);
                assert!(
                    (grad[[i, j]] - numeric).abs() < 1e-2,
                    "analytic {} vs numeric {}",
                    grad[[i, j]],
                    numeric
                );
            }
        }
    }

    #[test]
    fn test_stochastic_forward_varies_with_dropout() {
        let mut rng = StdRng::seed_from_u64(2);
        let clf = Classifier::new(&[6, 32, 3], Some(0.5), &mut rng).unwrap();
        let x = Array2::from_shape_fn((1, 6), |_| rng.random::<f32>());
        let a = clf.logits(&x, Mode::Stochastic, &mut rng).unwrap();
        let b = clf.logits(&x, Mode::Stochastic, &mut rng).unwrap();
        assert_ne!(a, b);
        // deterministic path is stable
        let c = clf.logits(&x, Mode::Standard, &mut rng).unwrap();
        let d = clf.logits(&x, Mode::Standard, &mut rng).unwrap();
        assert_eq!(c, d);
    }

    #[test]
    fn test_width_mismatch_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let clf = Classifier::new(&[4, 8, 2], None, &mut rng).unwrap();
        let x = Array2::<f32>::zeros((1, 5));
        assert!(clf.logits(&x, Mode::Standard, &mut rng).is_err());
    }
}
