//! Decision-based boundary attack. Only label queries are made: start from
//! an adversarial blend of uniform noise, then walk along the decision
//! boundary with orthogonal (spherical) proposals and steps toward the
//! original, adapting both step sizes from the recent acceptance rates.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use aegis_core::{PixelRange, Result};
use aegis_nn::{loss, Mode, Pipeline};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundaryParams {
    pub steps: usize,
    pub spherical_step: f32,
    pub source_step: f32,
    pub step_adaptation: f32,
    pub convergence_threshold: f32,
    pub update_stats_every_k: usize,
    pub init_trials: usize,
}

impl Default for BoundaryParams {
    fn default() -> Self {
        Self {
            steps: 2500,
            spherical_step: 0.01,
            source_step: 0.01,
            step_adaptation: 1.5,
            convergence_threshold: 1e-7,
            update_stats_every_k: 10,
            init_trials: 25,
        }
    }
}

/// Attack a whole batch, one example at a time. Examples with no adversarial
/// starting point keep a zero perturbation.
pub fn boundary_attack<P: Pipeline>(
    pipeline: &P,
    x: &Array2<f32>,
    targets: &[usize],
    params: &BoundaryParams,
    range: &PixelRange,
    rng: &mut StdRng,
) -> Result<Array2<f32>> {
    let mut delta = Array2::zeros(x.raw_dim());
    for (i, &label) in targets.iter().enumerate() {
        let original = x.row(i).to_owned();
        match attack_one(pipeline, &original, label, params, range, rng)? {
            Some(adv) => {
                let d = &adv - &original;
                delta.row_mut(i).assign(&d);
            }
            None => {
                warn!(example = i, "no adversarial starting point; keeping zero perturbation");
            }
        }
    }
    Ok(delta)
}

fn attack_one<P: Pipeline>(
    pipeline: &P,
    original: &Array1<f32>,
    label: usize,
    params: &BoundaryParams,
    range: &PixelRange,
    rng: &mut StdRng,
) -> Result<Option<Array1<f32>>> {
    let Some(mut current) = init_blended_noise(pipeline, original, label, params, range, rng)?
    else {
        return Ok(None);
    };

    let mut spherical_step = params.spherical_step;
    let mut source_step = params.source_step;
    let mut spherical_hits = 0_usize;
    let mut source_hits = 0_usize;
    let mut window = 0_usize;

    for step in 0..params.steps {
        let toward = original - &current;
        let dist = norm(&toward);
        if dist <= f32::EPSILON {
            break;
        }
        let unit = toward.mapv(|v| v / dist);

        // orthogonal proposal on the sphere of radius `dist` around the
        // original
        let mut noise: Array1<f32> =
            Array1::from_shape_fn(current.len(), |_| StandardNormal.sample(rng));
        let along = noise.dot(&unit);
        noise.zip_mut_with(&unit, |n, &u| *n -= along * u);
        let noise_norm = norm(&noise);
        if noise_norm <= f32::EPSILON {
            continue;
        }
        noise.mapv_inplace(|v| v * spherical_step * dist / noise_norm);

        let mut spherical = &current + &noise;
        let back = &spherical - original;
        let back_norm = norm(&back);
        if back_norm > f32::EPSILON {
            spherical = original + &back.mapv(|v| v * dist / back_norm);
        }
        spherical.mapv_inplace(|v| range.clamp(v));

        window += 1;
        if is_adversarial(pipeline, &spherical, label, rng)? {
            spherical_hits += 1;
            // step toward the original from the spherical candidate
            let mut candidate = &spherical + &(original - &spherical).mapv(|v| v * source_step);
            candidate.mapv_inplace(|v| range.clamp(v));
            if is_adversarial(pipeline, &candidate, label, rng)? {
                source_hits += 1;
                current = candidate;
            } else {
                current = spherical;
            }
        }

        if window >= params.update_stats_every_k {
            let spherical_rate = spherical_hits as f32 / window as f32;
            let source_rate = source_hits as f32 / window as f32;
            if spherical_rate > 0.5 {
                spherical_step *= params.step_adaptation;
            } else if spherical_rate < 0.2 {
                spherical_step /= params.step_adaptation;
            }
            if source_rate > 0.25 {
                source_step *= params.step_adaptation;
            } else if source_rate < 0.1 {
                source_step /= params.step_adaptation;
            }
            spherical_hits = 0;
            source_hits = 0;
            window = 0;
        }
        if source_step < params.convergence_threshold {
            debug!(step, "boundary attack converged");
            break;
        }
    }
    Ok(Some(current))
}

/// Blended uniform-noise initialization: draw uniform images until one is
/// adversarial, then binary-search the blend toward the original for the
/// closest adversarial mixture.
fn init_blended_noise<P: Pipeline>(
    pipeline: &P,
    original: &Array1<f32>,
    label: usize,
    params: &BoundaryParams,
    range: &PixelRange,
    rng: &mut StdRng,
) -> Result<Option<Array1<f32>>> {
    for _ in 0..params.init_trials {
        let noise =
            Array1::from_shape_fn(original.len(), |_| rng.random_range(range.min..=range.max));
        if !is_adversarial(pipeline, &noise, label, rng)? {
            continue;
        }
        // blend factor 1.0 is pure noise, 0.0 the original
        let mut lo = 0.0_f32;
        let mut hi = 1.0_f32;
        for _ in 0..10 {
            let mid = (lo + hi) / 2.0;
            let blend = original.mapv(|v| v * (1.0 - mid)) + noise.mapv(|v| v * mid);
            if is_adversarial(pipeline, &blend, label, rng)? {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        let start = original.mapv(|v| v * (1.0 - hi)) + noise.mapv(|v| v * hi);
        return Ok(Some(start));
    }
    Ok(None)
}

fn is_adversarial<P: Pipeline>(
    pipeline: &P,
    image: &Array1<f32>,
    label: usize,
    rng: &mut StdRng,
) -> Result<bool> {
    let batch = image.view().insert_axis(Axis(0)).to_owned();
    let logits = pipeline.logits(&batch, Mode::Standard, rng)?;
    Ok(loss::argmax_rows(&logits)[0] != label)
}

fn norm(v: &Array1<f32>) -> f32 {
    v.iter().map(|a| a * a).sum::<f32>().sqrt()
}
