//! Sparse-frontend denoising autoencoder: affine encoder, top-K sparsifier,
//! optional dropout on the code, linear decoder. The sparsifier's backward
//! treatment is fixed at construction: either the exact maxpool-like
//! gradient or the straight-through identity used for BPDA-style attacks.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use aegis_core::{AegisError, Result};
use aegis_patch::Dictionary;

use crate::layers::{self, Dense, Mode};
use crate::optim::Optimizer;

/// How gradients cross the top-K sparsifier. Chosen when the model is
/// built, never toggled afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SparsifierBackward {
    /// Route gradient only through the units the forward kept.
    Exact,
    /// Straight-through: treat the sparsifier as identity on the way back.
    Identity,
}

#[derive(Debug, Clone)]
pub struct SparseAutoencoder {
    pub encoder: Dense,
    pub decoder: Dense,
    top_k: usize,
    backward: SparsifierBackward,
    dropout: Option<f32>,
}

/// Everything the backward pass needs from one forward.
pub struct AeCache {
    x: Array2<f32>,
    code: Array2<f32>,
    topk_mask: Array2<f32>,
    drop_mask: Array2<f32>,
}

/// Parameter gradients for one batch, in the same layout as the layers.
pub struct AeGrads {
    pub enc_w: Array2<f32>,
    pub enc_b: Array1<f32>,
    pub dec_w: Array2<f32>,
    pub dec_b: Array1<f32>,
}

impl SparseAutoencoder {
    pub fn new(
        input_dim: usize,
        n_atoms: usize,
        top_k: usize,
        backward: SparsifierBackward,
        dropout: Option<f32>,
        rng: &mut StdRng,
    ) -> Result<Self> {
        check_hyper(n_atoms, top_k, dropout)?;
        Ok(Self {
            encoder: Dense::new_random(input_dim, n_atoms, rng)?,
            decoder: Dense::new_random(n_atoms, input_dim, rng)?,
            top_k,
            backward,
            dropout,
        })
    }

    /// Warm start from a learned patch dictionary: the encoder analyzes with
    /// the atoms as rows, the decoder synthesizes with the atoms as columns.
    pub fn from_dictionary(
        dict: &Dictionary,
        top_k: usize,
        backward: SparsifierBackward,
        dropout: Option<f32>,
    ) -> Result<Self> {
        let n_atoms = dict.n_atoms();
        let dim = dict.atom_len();
        check_hyper(n_atoms, top_k, dropout)?;
        let encoder = Dense::from_parts(dict.atoms().clone(), Array1::zeros(n_atoms))?;
        let decoder = Dense::from_parts(dict.atoms_as_columns(), Array1::zeros(dim))?;
        Ok(Self {
            encoder,
            decoder,
            top_k,
            backward,
            dropout,
        })
    }

    pub fn from_parts(
        encoder: Dense,
        decoder: Dense,
        top_k: usize,
        backward: SparsifierBackward,
        dropout: Option<f32>,
    ) -> Result<Self> {
        if encoder.out_dim() != decoder.in_dim() || encoder.in_dim() != decoder.out_dim() {
            return Err(AegisError::ShapeMismatch {
                expected: vec![encoder.out_dim(), encoder.in_dim()],
                got: vec![decoder.in_dim(), decoder.out_dim()],
            });
        }
        check_hyper(encoder.out_dim(), top_k, dropout)?;
        Ok(Self {
            encoder,
            decoder,
            top_k,
            backward,
            dropout,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.encoder.in_dim()
    }

    pub fn n_atoms(&self) -> usize {
        self.encoder.out_dim()
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn backward_variant(&self) -> SparsifierBackward {
        self.backward
    }

    pub fn dropout(&self) -> Option<f32> {
        self.dropout
    }

    pub fn has_stochastic_layer(&self) -> bool {
        self.dropout.is_some()
    }

    pub fn forward(&self, x: &Array2<f32>, mode: Mode, rng: &mut StdRng) -> Result<Array2<f32>> {
        Ok(self.forward_cached(x, mode, rng)?.0)
    }

    pub fn forward_cached(
        &self,
        x: &Array2<f32>,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<(Array2<f32>, AeCache)> {
        if x.ncols() != self.input_dim() {
            return Err(AegisError::ShapeMismatch {
                expected: vec![self.input_dim()],
                got: vec![x.ncols()],
            });
        }
        let pre = self.encoder.forward(x);
        let (sparse, topk_mask) = layers::topk_forward(&pre, self.top_k);
        let (code, drop_mask) =
            layers::dropout_forward(&sparse, self.dropout.unwrap_or(0.0), mode, rng);
        let recon = self.decoder.forward(&code);
        Ok((
            recon,
            AeCache {
                x: x.clone(),
                code,
                topk_mask,
                drop_mask,
            },
        ))
    }

    /// Gradient of the reconstruction with respect to the input only.
    pub fn backward_input(&self, cache: &AeCache, grad_recon: &Array2<f32>) -> Array2<f32> {
        let grad_code = grad_recon.dot(&self.decoder.w);
        let grad_sparse = layers::dropout_backward(&cache.drop_mask, &grad_code);
        let grad_pre = self.cross_sparsifier(&cache.topk_mask, &grad_sparse);
        grad_pre.dot(&self.encoder.w)
    }

    /// Full backward pass: parameter gradients for both layers plus the
    /// input gradient.
    pub fn backward(
        &self,
        cache: &AeCache,
        grad_recon: &Array2<f32>,
    ) -> (Array2<f32>, AeGrads) {
        let (grad_code, dec_w, dec_b) = self.decoder.backward(&cache.code, grad_recon);
        let grad_sparse = layers::dropout_backward(&cache.drop_mask, &grad_code);
        let grad_pre = self.cross_sparsifier(&cache.topk_mask, &grad_sparse);
        let (grad_x, enc_w, enc_b) = self.encoder.backward(&cache.x, &grad_pre);
        (
            grad_x,
            AeGrads {
                enc_w,
                enc_b,
                dec_w,
                dec_b,
            },
        )
    }

    fn cross_sparsifier(&self, mask: &Array2<f32>, grad: &Array2<f32>) -> Array2<f32> {
        match self.backward {
            SparsifierBackward::Exact => layers::topk_backward(mask, grad),
            SparsifierBackward::Identity => grad.clone(),
        }
    }

    /// Apply one optimizer step with the given gradients. Slots 0..3 key the
    /// optimizer state for the four tensors.
    pub fn apply_grads(&mut self, grads: &AeGrads, opt: &mut Optimizer) -> Result<()> {
        opt.update(0, slice_mut_2(&mut self.encoder.w)?, slice_2(&grads.enc_w)?)?;
        opt.update(1, slice_mut_1(&mut self.encoder.b)?, slice_1(&grads.enc_b)?)?;
        opt.update(2, slice_mut_2(&mut self.decoder.w)?, slice_2(&grads.dec_w)?)?;
        opt.update(3, slice_mut_1(&mut self.decoder.b)?, slice_1(&grads.dec_b)?)?;
        Ok(())
    }
}

fn check_hyper(n_atoms: usize, top_k: usize, dropout: Option<f32>) -> Result<()> {
    if top_k == 0 || top_k > n_atoms {
        return Err(AegisError::InvalidArgument(format!(
            "top_k must be in 1..={n_atoms}, got {top_k}"
        )));
    }
    if let Some(p) = dropout {
        if !(0.0..1.0).contains(&p) {
            return Err(AegisError::InvalidArgument(format!(
                "dropout probability must be in [0, 1), got {p}"
            )));
        }
    }
    Ok(())
}

fn slice_2(a: &Array2<f32>) -> Result<&[f32]> {
    a.as_slice()
        .ok_or_else(|| AegisError::ContractViolation("non-contiguous gradient".into()))
}

fn slice_mut_2(a: &mut Array2<f32>) -> Result<&mut [f32]> {
    a.as_slice_mut()
        .ok_or_else(|| AegisError::ContractViolation("non-contiguous parameter".into()))
}

fn slice_1(a: &Array1<f32>) -> Result<&[f32]> {
    a.as_slice()
        .ok_or_else(|| AegisError::ContractViolation("non-contiguous gradient".into()))
}

fn slice_mut_1(a: &mut Array1<f32>) -> Result<&mut [f32]> {
    a.as_slice_mut()
        .ok_or_else(|| AegisError::ContractViolation("non-contiguous parameter".into()))
}
