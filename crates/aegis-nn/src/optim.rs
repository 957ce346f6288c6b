//! Optimizers and learning-rate schedules for the autoencoder trainer.
//! Parameters are addressed as flat slices keyed by a slot index, so the
//! optimizers carry per-tensor state without knowing the model layout.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use aegis_core::{AegisError, Result};

/// Which update rule to run, with its hyperparameters. Parsed from the
/// bare tokens `sgd`, `rms` and `adam`; anything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OptimizerSpec {
    Sgd {
        lr: f32,
        momentum: f32,
        weight_decay: f32,
    },
    RmsProp {
        lr: f32,
        alpha: f32,
        eps: f32,
        momentum: f32,
        weight_decay: f32,
    },
    Adam {
        lr: f32,
        beta1: f32,
        beta2: f32,
        eps: f32,
    },
}

impl OptimizerSpec {
    pub fn lr(&self) -> f32 {
        match *self {
            OptimizerSpec::Sgd { lr, .. }
            | OptimizerSpec::RmsProp { lr, .. }
            | OptimizerSpec::Adam { lr, .. } => lr,
        }
    }

    pub fn with_lr(mut self, new_lr: f32) -> Self {
        match &mut self {
            OptimizerSpec::Sgd { lr, .. }
            | OptimizerSpec::RmsProp { lr, .. }
            | OptimizerSpec::Adam { lr, .. } => *lr = new_lr,
        }
        self
    }

    pub fn name(&self) -> &'static str {
        match self {
            OptimizerSpec::Sgd { .. } => "sgd",
            OptimizerSpec::RmsProp { .. } => "rms",
            OptimizerSpec::Adam { .. } => "adam",
        }
    }
}

impl FromStr for OptimizerSpec {
    type Err = AegisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sgd" => Ok(OptimizerSpec::Sgd {
                lr: 0.01,
                momentum: 0.9,
                weight_decay: 0.0,
            }),
            "rms" => Ok(OptimizerSpec::RmsProp {
                lr: 0.01,
                alpha: 0.99,
                eps: 1e-8,
                momentum: 0.9,
                weight_decay: 0.0,
            }),
            "adam" => Ok(OptimizerSpec::Adam {
                lr: 0.001,
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
            }),
            other => Err(AegisError::UnsupportedConfig(format!(
                "optimizer not understood: {other}"
            ))),
        }
    }
}

#[derive(Default)]
struct Slot {
    m: Vec<f32>,
    v: Vec<f32>,
    t: u64,
}

pub struct Optimizer {
    spec: OptimizerSpec,
    lr: f32,
    state: HashMap<usize, Slot>,
}

impl Optimizer {
    pub fn new(spec: OptimizerSpec) -> Self {
        Self {
            lr: spec.lr(),
            spec,
            state: HashMap::new(),
        }
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    /// One update step for the tensor in `slot`. The slot keys the running
    /// state, so a given tensor must always use the same slot.
    pub fn update(&mut self, slot: usize, param: &mut [f32], grad: &[f32]) -> Result<()> {
        if param.len() != grad.len() {
            return Err(AegisError::ShapeMismatch {
                expected: vec![param.len()],
                got: vec![grad.len()],
            });
        }
        let entry = self.state.entry(slot).or_default();
        if entry.m.is_empty() {
            entry.m = vec![0.0; param.len()];
            entry.v = vec![0.0; param.len()];
        }
        if entry.m.len() != param.len() {
            return Err(AegisError::ContractViolation(format!(
                "slot {slot} reused for a tensor of different size"
            )));
        }
        let lr = self.lr;
        match self.spec {
            OptimizerSpec::Sgd {
                momentum,
                weight_decay,
                ..
            } => {
                for i in 0..param.len() {
                    let g = grad[i] + weight_decay * param[i];
                    entry.m[i] = momentum * entry.m[i] + g;
                    param[i] -= lr * entry.m[i];
                }
            }
            OptimizerSpec::RmsProp {
                alpha,
                eps,
                momentum,
                weight_decay,
                ..
            } => {
                for i in 0..param.len() {
                    let g = grad[i] + weight_decay * param[i];
                    entry.v[i] = alpha * entry.v[i] + (1.0 - alpha) * g * g;
                    entry.m[i] = momentum * entry.m[i] + g / (entry.v[i].sqrt() + eps);
                    param[i] -= lr * entry.m[i];
                }
            }
            OptimizerSpec::Adam {
                beta1, beta2, eps, ..
            } => {
                entry.t += 1;
                let t = entry.t as f32;
                let bc1 = 1.0 - beta1.powf(t);
                let bc2 = 1.0 - beta2.powf(t);
                for i in 0..param.len() {
                    let g = grad[i];
                    entry.m[i] = beta1 * entry.m[i] + (1.0 - beta1) * g;
                    entry.v[i] = beta2 * entry.v[i] + (1.0 - beta2) * g * g;
                    let m_hat = entry.m[i] / bc1;
                    let v_hat = entry.v[i] / bc2;
                    param[i] -= lr * m_hat / (v_hat.sqrt() + eps);
                }
            }
        }
        Ok(())
    }
}

/// Learning-rate schedule. `Cyclic` advances once per batch, the other two
/// once per epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerSpec {
    /// Triangular wave between `base_lr` and `max_lr`, `step_size_up`
    /// batches per half-cycle.
    Cyclic {
        base_lr: f32,
        max_lr: f32,
        step_size_up: usize,
    },
    /// Multiply the rate by `gamma` when the epoch count crosses each
    /// milestone.
    MultiStep { milestones: Vec<usize>, gamma: f32 },
    /// Multiply the rate by `factor` every `every` epochs.
    Multiplicative { every: usize, factor: f32 },
}

impl FromStr for SchedulerSpec {
    type Err = AegisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cyc" => Ok(SchedulerSpec::Cyclic {
                base_lr: 0.001,
                max_lr: 0.01,
                step_size_up: 2000,
            }),
            "step" => Ok(SchedulerSpec::MultiStep {
                milestones: vec![30, 60],
                gamma: 0.1,
            }),
            "mult" => Ok(SchedulerSpec::Multiplicative {
                every: 3,
                factor: 0.962,
            }),
            other => Err(AegisError::UnsupportedConfig(format!(
                "scheduler not understood: {other}"
            ))),
        }
    }
}

pub struct Scheduler {
    spec: SchedulerSpec,
    batches: usize,
    epochs: usize,
}

impl Scheduler {
    pub fn new(spec: SchedulerSpec) -> Self {
        Self {
            spec,
            batches: 0,
            epochs: 0,
        }
    }

    /// Call after every optimizer step.
    pub fn on_batch(&mut self, opt: &mut Optimizer) {
        if let SchedulerSpec::Cyclic {
            base_lr,
            max_lr,
            step_size_up,
        } = self.spec
        {
            self.batches += 1;
            let period = 2 * step_size_up;
            let pos = self.batches % period;
            let frac = if pos <= step_size_up {
                pos as f32 / step_size_up as f32
            } else {
                (period - pos) as f32 / step_size_up as f32
            };
            opt.set_lr(base_lr + (max_lr - base_lr) * frac);
        }
    }

    /// Call once at the end of every epoch.
    pub fn on_epoch(&mut self, opt: &mut Optimizer) {
        self.epochs += 1;
        match &self.spec {
            SchedulerSpec::Cyclic { .. } => {}
            SchedulerSpec::MultiStep { milestones, gamma } => {
                if milestones.contains(&self.epochs) {
                    let lr = opt.lr() * gamma;
                    opt.set_lr(lr);
                }
            }
            SchedulerSpec::Multiplicative { every, factor } => {
                if *every > 0 && self.epochs % every == 0 {
                    let lr = opt.lr() * factor;
                    opt.set_lr(lr);
                }
            }
        }
    }
}
