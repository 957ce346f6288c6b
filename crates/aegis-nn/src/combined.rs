//! Defense pipelines: the autoencoder frontend composed with a classifier.
//! `Combined` differentiates through the whole stack; `CombinedOuterBpda`
//! evaluates the same forward but takes gradients through the classifier
//! alone, which is the straight-through treatment black-box-of-the-frontend
//! attacks assume.

use ndarray::Array2;
use rand::rngs::StdRng;

use aegis_core::Result;

use crate::autoencoder::SparseAutoencoder;
use crate::classifier::Classifier;
use crate::layers::Mode;
use crate::loss::{self, Loss};

/// A differentiable image-to-logits model an attack can query.
pub trait Pipeline {
    fn logits(&self, x: &Array2<f32>, mode: Mode, rng: &mut StdRng) -> Result<Array2<f32>>;

    /// Gradient of `loss` at the input, for the given true labels.
    fn input_gradient(
        &self,
        x: &Array2<f32>,
        targets: &[usize],
        loss: Loss,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<Array2<f32>>;

    fn num_classes(&self) -> usize;

    fn has_stochastic_layer(&self) -> bool {
        false
    }
}

impl<P: Pipeline + ?Sized> Pipeline for &P {
    fn logits(&self, x: &Array2<f32>, mode: Mode, rng: &mut StdRng) -> Result<Array2<f32>> {
        (**self).logits(x, mode, rng)
    }

    fn input_gradient(
        &self,
        x: &Array2<f32>,
        targets: &[usize],
        loss: Loss,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<Array2<f32>> {
        (**self).input_gradient(x, targets, loss, mode, rng)
    }

    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn has_stochastic_layer(&self) -> bool {
        (**self).has_stochastic_layer()
    }
}

impl<P: Pipeline + ?Sized> Pipeline for Box<P> {
    fn logits(&self, x: &Array2<f32>, mode: Mode, rng: &mut StdRng) -> Result<Array2<f32>> {
        (**self).logits(x, mode, rng)
    }

    fn input_gradient(
        &self,
        x: &Array2<f32>,
        targets: &[usize],
        loss: Loss,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<Array2<f32>> {
        (**self).input_gradient(x, targets, loss, mode, rng)
    }

    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn has_stochastic_layer(&self) -> bool {
        (**self).has_stochastic_layer()
    }
}

impl Pipeline for Classifier {
    fn logits(&self, x: &Array2<f32>, mode: Mode, rng: &mut StdRng) -> Result<Array2<f32>> {
        Classifier::logits(self, x, mode, rng)
    }

    fn input_gradient(
        &self,
        x: &Array2<f32>,
        targets: &[usize],
        loss: Loss,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<Array2<f32>> {
        Classifier::input_gradient(self, x, targets, loss, mode, rng)
    }

    fn num_classes(&self) -> usize {
        Classifier::num_classes(self)
    }

    fn has_stochastic_layer(&self) -> bool {
        Classifier::has_stochastic_layer(self)
    }
}

/// Autoencoder frontend followed by a classifier, differentiated end to end.
pub struct Combined {
    pub autoencoder: SparseAutoencoder,
    pub classifier: Classifier,
}

impl Combined {
    pub fn new(autoencoder: SparseAutoencoder, classifier: Classifier) -> Result<Self> {
        if autoencoder.input_dim() != classifier.input_dim() {
            return Err(aegis_core::AegisError::ShapeMismatch {
                expected: vec![autoencoder.input_dim()],
                got: vec![classifier.input_dim()],
            });
        }
        Ok(Self {
            autoencoder,
            classifier,
        })
    }
}

impl Pipeline for Combined {
    fn logits(&self, x: &Array2<f32>, mode: Mode, rng: &mut StdRng) -> Result<Array2<f32>> {
        let recon = self.autoencoder.forward(x, mode, rng)?;
        self.classifier.logits(&recon, mode, rng)
    }

    fn input_gradient(
        &self,
        x: &Array2<f32>,
        targets: &[usize],
        loss: Loss,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<Array2<f32>> {
        let (recon, ae_cache) = self.autoencoder.forward_cached(x, mode, rng)?;
        let (logits, clf_cache) = self.classifier.logits_cached(&recon, mode, rng)?;
        let (_, grad_logits) = loss::loss_grad(loss, &logits, targets)?;
        let grad_recon = self.classifier.backward_input(&clf_cache, &grad_logits);
        Ok(self.autoencoder.backward_input(&ae_cache, &grad_recon))
    }

    fn num_classes(&self) -> usize {
        self.classifier.num_classes()
    }

    fn has_stochastic_layer(&self) -> bool {
        self.autoencoder.has_stochastic_layer() || self.classifier.has_stochastic_layer()
    }
}

/// Same forward as `Combined`, but the input gradient is the classifier's
/// gradient evaluated at the reconstruction. The frontend is treated as
/// identity on the way back; that choice is baked in at construction.
pub struct CombinedOuterBpda {
    pub autoencoder: SparseAutoencoder,
    pub classifier: Classifier,
}

impl CombinedOuterBpda {
    pub fn new(autoencoder: SparseAutoencoder, classifier: Classifier) -> Result<Self> {
        let inner = Combined::new(autoencoder, classifier)?;
        Ok(Self {
            autoencoder: inner.autoencoder,
            classifier: inner.classifier,
        })
    }

    /// The module gradients are actually taken through.
    pub fn outer_module(&self) -> &Classifier {
        &self.classifier
    }
}

impl Pipeline for CombinedOuterBpda {
    fn logits(&self, x: &Array2<f32>, mode: Mode, rng: &mut StdRng) -> Result<Array2<f32>> {
        let recon = self.autoencoder.forward(x, mode, rng)?;
        self.classifier.logits(&recon, mode, rng)
    }

    fn input_gradient(
        &self,
        x: &Array2<f32>,
        targets: &[usize],
        loss: Loss,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<Array2<f32>> {
        let recon = self.autoencoder.forward(x, mode, rng)?;
        self.classifier
            .input_gradient(&recon, targets, loss, mode, rng)
    }

    fn num_classes(&self) -> usize {
        self.classifier.num_classes()
    }

    fn has_stochastic_layer(&self) -> bool {
        self.autoencoder.has_stochastic_layer() || self.classifier.has_stochastic_layer()
    }
}
