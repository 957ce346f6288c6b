//! Attack specification: closed enums parsed from CLI tokens. The `CWlinf-`
//! prefix is not a routine of its own; it resolves to the matching PGD
//! routine with the Carlini-Wagner loss swapped in.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use aegis_core::{AegisError, Result};
use aegis_nn::Loss;

/// The concrete iteration scheme a method resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Routine {
    Fgsm,
    Rfgsm,
    Pgd,
    PgdEot,
    PgdEotNormalized,
    PgdEotSign,
}

/// A parsed attack method: routine plus the loss it ascends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttackMethod {
    pub routine: Routine,
    pub loss: Loss,
}

impl FromStr for AttackMethod {
    type Err = AegisError;

    fn from_str(s: &str) -> Result<Self> {
        let (loss, rest) = match s.strip_prefix("CWlinf-") {
            Some(rest) => (Loss::CarliniWagner, rest),
            None => (Loss::CrossEntropy, s),
        };
        let routine = match rest {
            "FGSM" => Routine::Fgsm,
            "RFGSM" => Routine::Rfgsm,
            "PGD" => Routine::Pgd,
            "PGD-EOT" => Routine::PgdEot,
            "PGD-EOT-normalized" => Routine::PgdEotNormalized,
            "PGD-EOT-sign" => Routine::PgdEotSign,
            _ => {
                return Err(AegisError::UnsupportedConfig(format!(
                    "attack method not understood: {s}"
                )))
            }
        };
        // the margin loss only pairs with the PGD family
        if loss == Loss::CarliniWagner && matches!(routine, Routine::Fgsm | Routine::Rfgsm) {
            return Err(AegisError::UnsupportedConfig(format!(
                "attack method not understood: {s}"
            )));
        }
        Ok(AttackMethod { routine, loss })
    }
}

/// Which part of the pipeline a white-box attack differentiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhiteboxKind {
    /// Gradients through the whole defended pipeline.
    Full,
    /// Gradients through the outer classifier only, the frontend treated as
    /// identity on the way back.
    OuterModule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtherboxKind {
    /// Label-query-only boundary attack.
    Decision,
    /// Evaluate precomputed adversarial images from disk; never generates.
    Transfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxKind {
    White(WhiteboxKind),
    Other(OtherboxKind),
}

impl FromStr for BoxKind {
    type Err = AegisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "white" => Ok(BoxKind::White(WhiteboxKind::Full)),
            "white-outer" => Ok(BoxKind::White(WhiteboxKind::OuterModule)),
            "decision" => Ok(BoxKind::Other(OtherboxKind::Decision)),
            "transfer" => Ok(BoxKind::Other(OtherboxKind::Transfer)),
            other => Err(AegisError::UnsupportedConfig(format!(
                "box type not understood: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormKind {
    Inf,
    L2,
}

impl FromStr for NormKind {
    type Err = AegisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inf" => Ok(NormKind::Inf),
            "l2" => Ok(NormKind::L2),
            other => Err(AegisError::UnsupportedConfig(format!(
                "norm not understood: {other}"
            ))),
        }
    }
}

/// Knobs shared by the gradient attack family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttackParams {
    pub norm: NormKind,
    pub eps: f32,
    pub step_size: f32,
    pub num_steps: usize,
    pub random_start: bool,
    pub num_restarts: usize,
    pub eot_size: usize,
}

impl Default for AttackParams {
    fn default() -> Self {
        Self {
            norm: NormKind::Inf,
            eps: 8.0 / 255.0,
            step_size: 2.0 / 255.0,
            num_steps: 20,
            random_start: true,
            num_restarts: 1,
            eot_size: 8,
        }
    }
}

impl AttackParams {
    pub fn validate(&self) -> Result<()> {
        if self.eps < 0.0 || !self.eps.is_finite() {
            return Err(AegisError::InvalidArgument(format!(
                "eps must be finite and non-negative, got {}",
                self.eps
            )));
        }
        if self.step_size <= 0.0 {
            return Err(AegisError::InvalidArgument(format!(
                "step size must be positive, got {}",
                self.step_size
            )));
        }
        if self.eot_size == 0 {
            return Err(AegisError::InvalidArgument(
                "eot size must be nonzero".into(),
            ));
        }
        Ok(())
    }
}
