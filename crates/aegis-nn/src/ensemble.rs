//! Post-softmax ensembling over stochastic forward passes. With dropout
//! live, averaging the softmax of several passes gives a smoothed predictor;
//! gradients are averaged the same way so attacks see the expectation.

use ndarray::Array2;
use rand::rngs::StdRng;
use tracing::warn;

use aegis_core::{AegisError, Result};

use crate::combined::Pipeline;
use crate::layers::Mode;
use crate::loss::{self, Loss};

pub struct EnsemblePostSoftmax<P: Pipeline> {
    inner: P,
    passes: usize,
}

impl<P: Pipeline> EnsemblePostSoftmax<P> {
    pub fn new(inner: P, passes: usize) -> Result<Self> {
        if passes == 0 {
            return Err(AegisError::InvalidArgument(
                "ensemble needs at least one pass".into(),
            ));
        }
        if !inner.has_stochastic_layer() {
            warn!("ensembling a deterministic model; all passes will agree");
        }
        Ok(Self { inner, passes })
    }

    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Mean softmax over `passes` stochastic forwards.
    pub fn mean_probs(&self, x: &Array2<f32>, rng: &mut StdRng) -> Result<Array2<f32>> {
        let mut acc: Option<Array2<f32>> = None;
        for _ in 0..self.passes {
            let logits = self.inner.logits(x, Mode::Stochastic, rng)?;
            let probs = loss::softmax_rows(&logits);
            acc = Some(match acc {
                Some(a) => a + probs,
                None => probs,
            });
        }
        let mut mean = acc.ok_or_else(|| {
            AegisError::ContractViolation("ensemble produced no passes".into())
        })?;
        mean.mapv_inplace(|v| v / self.passes as f32);
        Ok(mean)
    }
}

impl<P: Pipeline> Pipeline for EnsemblePostSoftmax<P> {
    /// Returns averaged probabilities rather than raw logits; argmax is
    /// unaffected, which is all the evaluation reads from this.
    fn logits(&self, x: &Array2<f32>, _mode: Mode, rng: &mut StdRng) -> Result<Array2<f32>> {
        self.mean_probs(x, rng)
    }

    fn input_gradient(
        &self,
        x: &Array2<f32>,
        targets: &[usize],
        loss: Loss,
        _mode: Mode,
        rng: &mut StdRng,
    ) -> Result<Array2<f32>> {
        let mut acc: Option<Array2<f32>> = None;
        for _ in 0..self.passes {
            let g = self
                .inner
                .input_gradient(x, targets, loss, Mode::Stochastic, rng)?;
            acc = Some(match acc {
                Some(a) => a + g,
                None => g,
            });
        }
        let mut mean = acc.ok_or_else(|| {
            AegisError::ContractViolation("ensemble produced no passes".into())
        })?;
        mean.mapv_inplace(|v| v / self.passes as f32);
        Ok(mean)
    }

    fn num_classes(&self) -> usize {
        self.inner.num_classes()
    }

    fn has_stochastic_layer(&self) -> bool {
        self.inner.has_stochastic_layer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use ndarray::Array2;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_mean_probs_rows_sum_to_one() {
        let mut rng = StdRng::seed_from_u64(4);
        let clf = Classifier::new(&[6, 24, 3], Some(0.3), &mut rng).unwrap();
        let ens = EnsemblePostSoftmax::new(clf, 8).unwrap();
        let x = Array2::from_shape_fn((3, 6), |_| rng.random::<f32>());
        let probs = ens.mean_probs(&x, &mut rng).unwrap();
        for row in probs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_deterministic_inner_gives_plain_softmax() {
        let mut rng = StdRng::seed_from_u64(6);
        let clf = Classifier::new(&[4, 8, 2], None, &mut rng).unwrap();
        let x = Array2::from_shape_fn((2, 4), |_| rng.random::<f32>());
        let single = crate::loss::softmax_rows(
            &crate::combined::Pipeline::logits(&clf, &x, Mode::Stochastic, &mut rng).unwrap(),
        );
        let ens = EnsemblePostSoftmax::new(clf, 5).unwrap();
        let mean = ens.mean_probs(&x, &mut rng).unwrap();
        for (a, b) in mean.iter().zip(single.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_zero_passes_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let clf = Classifier::new(&[4, 2], None, &mut rng).unwrap();
        assert!(EnsemblePostSoftmax::new(clf, 0).is_err());
    }
}
