//! The attack run itself: resolve the configuration, generate adversarial
//! examples batch by batch until the example budget is spent, clamp, and
//! report top-1 accuracy under attack. Transfer runs never generate; they
//! evaluate a precomputed dump.

use std::path::PathBuf;
use std::time::Instant;

use ndarray::{s, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use aegis_core::{AegisError, PixelRange, Result};
use aegis_data::Dataset;
use aegis_nn::{loss, Mode, Pipeline};

use crate::boundary::{self, BoundaryParams};
use crate::gradient;
use crate::spec::{AttackMethod, AttackParams, BoxKind, OtherboxKind};
use crate::storage;

#[derive(Debug, Clone)]
pub struct AttackConfig {
    pub method: AttackMethod,
    pub box_kind: BoxKind,
    pub params: AttackParams,
    pub boundary: BoundaryParams,
    /// Number of test examples to attack and score.
    pub budget: usize,
    pub batch_size: usize,
    /// Skip the clean-accuracy pass before attacking.
    pub skip_clean: bool,
    /// Persist attacked images as one dense `.npy` in test-set order.
    pub save_path: Option<PathBuf>,
    /// Precomputed adversarial dump for the transfer box type.
    pub transfer_path: Option<PathBuf>,
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub struct AttackOutcome {
    pub clean_accuracy: Option<f32>,
    pub robust_accuracy: f32,
    pub images_evaluated: usize,
    pub batches_processed: usize,
}

/// Generate one batch of perturbations for the resolved box type. A
/// transfer request must never reach this point.
pub fn generate_perturbation<P: Pipeline>(
    pipeline: &P,
    box_kind: BoxKind,
    method: AttackMethod,
    x: &Array2<f32>,
    targets: &[usize],
    params: &AttackParams,
    boundary_params: &BoundaryParams,
    range: &PixelRange,
    rng: &mut StdRng,
) -> Result<Array2<f32>> {
    match box_kind {
        BoxKind::White(_) => gradient::perturb(
            pipeline,
            method.routine,
            method.loss,
            x,
            targets,
            params,
            range,
            rng,
        ),
        BoxKind::Other(OtherboxKind::Decision) => {
            boundary::boundary_attack(pipeline, x, targets, boundary_params, range, rng)
        }
        BoxKind::Other(OtherboxKind::Transfer) => Err(AegisError::ContractViolation(
            "transfer attack reached the generation step".into(),
        )),
    }
}

/// Run an attack over the budgeted head of the test set.
///
/// `generator` is the model the attack differentiates or queries;
/// `scorer` is the deployed model the accuracies are measured on. They
/// are the same object except when ensembling wraps the scorer only,
/// so perturbations are crafted against raw logits while the reported
/// accuracy reflects the averaged predictor.
pub fn run_attack<G: Pipeline, S: Pipeline>(
    generator: &G,
    scorer: &S,
    dataset: &Dataset,
    cfg: &AttackConfig,
) -> Result<AttackOutcome> {
    if cfg.batch_size == 0 {
        return Err(AegisError::InvalidArgument("batch size must be nonzero".into()));
    }
    if cfg.budget == 0 || dataset.is_empty() {
        return Err(AegisError::InvalidArgument(
            "nothing to attack: empty budget or dataset".into(),
        ));
    }
    let budget = cfg.budget.min(dataset.len());
    let range = PixelRange::default();
    let mut rng = StdRng::seed_from_u64(cfg.seed);

    let clean_accuracy = if cfg.skip_clean {
        None
    } else {
        let flat = dataset.flatten();
        let head = flat.slice(s![..budget, ..]).to_owned();
        let acc = accuracy(scorer, &head, &dataset.labels[..budget], cfg.batch_size, &mut rng)?;
        info!(accuracy = acc, images = budget, "clean accuracy");
        Some(acc)
    };

    if let BoxKind::Other(OtherboxKind::Transfer) = cfg.box_kind {
        return run_transfer(scorer, dataset, cfg, budget, clean_accuracy, &mut rng);
    }

    let start = Instant::now();
    let mut attacked_rows: Vec<Array2<f32>> = Vec::new();
    let mut seen = 0_usize;
    let mut batches_processed = 0_usize;

    for (x, labels) in dataset.batches(cfg.batch_size) {
        // stop as soon as the budget is covered
        if seen >= budget {
            break;
        }
        let delta = generate_perturbation(
            generator,
            cfg.box_kind,
            cfg.method,
            &x,
            &labels,
            &cfg.params,
            &cfg.boundary,
            &range,
            &mut rng,
        )?;
        let mut adv = &x + &delta;
        // hard invariant: attacked pixels live in the data range
        adv.mapv_inplace(|v| range.clamp(v));
        seen += adv.nrows();
        batches_processed += 1;
        attacked_rows.push(adv);
    }

    let attacked = concat_rows(&attacked_rows)?;
    let attacked = attacked.slice(s![..budget, ..]).to_owned();
    info!(
        images = budget,
        batches = batches_processed,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "attack generation done"
    );

    if let Some(path) = &cfg.save_path {
        storage::save_adversarial(&attacked, path)?;
    }

    let robust_accuracy = accuracy(
        scorer,
        &attacked,
        &dataset.labels[..budget],
        cfg.batch_size,
        &mut rng,
    )?;
    info!(accuracy = robust_accuracy, images = budget, "robust accuracy");

    Ok(AttackOutcome {
        clean_accuracy,
        robust_accuracy,
        images_evaluated: budget,
        batches_processed,
    })
}

fn run_transfer<P: Pipeline>(
    scorer: &P,
    dataset: &Dataset,
    cfg: &AttackConfig,
    budget: usize,
    clean_accuracy: Option<f32>,
    rng: &mut StdRng,
) -> Result<AttackOutcome> {
    let path = cfg.transfer_path.as_ref().ok_or_else(|| {
        AegisError::InvalidArgument("transfer box type needs a precomputed dump path".into())
    })?;
    let images = storage::load_adversarial(path)?;
    if images.nrows() < budget {
        return Err(AegisError::InvalidArgument(format!(
            "dump holds {} images, budget needs {budget}",
            images.nrows()
        )));
    }
    if images.ncols() != dataset.feature_len() {
        return Err(AegisError::ShapeMismatch {
            expected: vec![dataset.feature_len()],
            got: vec![images.ncols()],
        });
    }
    let head = images.slice(s![..budget, ..]).to_owned();
    let robust_accuracy = accuracy(
        scorer,
        &head,
        &dataset.labels[..budget],
        cfg.batch_size,
        rng,
    )?;
    info!(
        accuracy = robust_accuracy,
        images = budget,
        source = %path.display(),
        "transfer accuracy"
    );
    Ok(AttackOutcome {
        clean_accuracy,
        robust_accuracy,
        images_evaluated: budget,
        batches_processed: 0,
    })
}

/// Top-1 accuracy of the pipeline on flattened images.
fn accuracy<P: Pipeline>(
    pipeline: &P,
    images: &Array2<f32>,
    labels: &[usize],
    batch_size: usize,
    rng: &mut StdRng,
) -> Result<f32> {
    if images.nrows() != labels.len() {
        return Err(AegisError::ShapeMismatch {
            expected: vec![images.nrows()],
            got: vec![labels.len()],
        });
    }
    let mut correct = 0_usize;
    let n = images.nrows();
    let mut lo = 0;
    while lo < n {
        let hi = (lo + batch_size).min(n);
        let chunk = images.slice_axis(Axis(0), (lo..hi).into()).to_owned();
        let logits = pipeline.logits(&chunk, Mode::Standard, rng)?;
        let preds = loss::argmax_rows(&logits);
        correct += preds
            .iter()
            .zip(&labels[lo..hi])
            .filter(|(p, l)| p == l)
            .count();
        lo = hi;
    }
    Ok(correct as f32 / n as f32)
}

fn concat_rows(chunks: &[Array2<f32>]) -> Result<Array2<f32>> {
    let views: Vec<_> = chunks.iter().map(|c| c.view()).collect();
    if views.is_empty() {
        return Err(AegisError::InvalidArgument("no batches attacked".into()));
    }
    ndarray::concatenate(Axis(0), &views)
        .map_err(|e| AegisError::ContractViolation(format!("batch concatenation failed: {e}")))
}
