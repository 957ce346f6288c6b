//! Autoencoder training loop. Batch suppliers are closures returning fresh
//! iterators so each epoch re-walks the dataset without the trainer knowing
//! where batches come from.

use std::time::Instant;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use aegis_core::{AegisError, Result};

use crate::autoencoder::SparseAutoencoder;
use crate::layers::Mode;
use crate::loss::mse_loss_grad;
use crate::optim::{Optimizer, OptimizerSpec, Scheduler, SchedulerSpec};

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub epochs: usize,
    pub optimizer: OptimizerSpec,
    pub scheduler: Option<SchedulerSpec>,
    pub seed: u64,
}

/// Per-epoch mean reconstruction losses.
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub train_losses: Vec<f32>,
    pub val_losses: Vec<f32>,
}

/// Train `ae` to reconstruct its input under MSE. `train_batches` and
/// `val_batches` are called once per epoch and must yield `(batch, features)`
/// matrices with the autoencoder's input width.
pub fn train_autoencoder<FT, IT, FV, IV>(
    ae: &mut SparseAutoencoder,
    train_batches: FT,
    val_batches: FV,
    cfg: &TrainConfig,
) -> Result<TrainReport>
where
    FT: Fn() -> IT,
    IT: Iterator<Item = Result<Array2<f32>>>,
    FV: Fn() -> IV,
    IV: Iterator<Item = Result<Array2<f32>>>,
{
    if cfg.epochs == 0 {
        return Err(AegisError::InvalidArgument("epochs must be nonzero".into()));
    }
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut opt = Optimizer::new(cfg.optimizer);
    let mut sched = cfg.scheduler.clone().map(Scheduler::new);

    info!(
        epochs = cfg.epochs,
        optimizer = cfg.optimizer.name(),
        lr = opt.lr(),
        "training autoencoder"
    );

    let mut report = TrainReport {
        train_losses: Vec::with_capacity(cfg.epochs),
        val_losses: Vec::with_capacity(cfg.epochs),
    };

    for epoch in 1..=cfg.epochs {
        let start = Instant::now();
        let mut loss_sum = 0.0_f64;
        let mut n_images = 0_usize;

        for batch in train_batches() {
            let x = batch?;
            let (recon, cache) = ae.forward_cached(&x, Mode::Stochastic, &mut rng)?;
            let (loss, grad_recon) = mse_loss_grad(&recon, &x)?;
            let (_, grads) = ae.backward(&cache, &grad_recon);
            ae.apply_grads(&grads, &mut opt)?;
            if let Some(s) = sched.as_mut() {
                s.on_batch(&mut opt);
            }
            loss_sum += loss as f64 * x.nrows() as f64;
            n_images += x.nrows();
        }
        if n_images == 0 {
            return Err(AegisError::InvalidArgument(
                "training stream yielded no batches".into(),
            ));
        }
        if let Some(s) = sched.as_mut() {
            s.on_epoch(&mut opt);
        }

        let train_loss = (loss_sum / n_images as f64) as f32;
        let val_loss = eval_mse(ae, val_batches(), &mut rng)?;
        report.train_losses.push(train_loss);
        report.val_losses.push(val_loss);
        info!(
            epoch,
            train_loss,
            val_loss,
            lr = opt.lr(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "epoch done"
        );
    }
    Ok(report)
}

/// Mean reconstruction MSE over a stream, deterministic forward.
pub fn eval_mse<I>(ae: &SparseAutoencoder, batches: I, rng: &mut StdRng) -> Result<f32>
where
    I: Iterator<Item = Result<Array2<f32>>>,
{
    let mut loss_sum = 0.0_f64;
    let mut n_images = 0_usize;
    for batch in batches {
        let x = batch?;
        let recon = ae.forward(&x, Mode::Standard, rng)?;
        let (loss, _) = mse_loss_grad(&recon, &x)?;
        loss_sum += loss as f64 * x.nrows() as f64;
        n_images += x.nrows();
    }
    if n_images == 0 {
        debug!("validation stream was empty");
        return Ok(f32::NAN);
    }
    Ok((loss_sum / n_images as f64) as f32)
}
