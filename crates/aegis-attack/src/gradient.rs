//! White-box gradient attack family. Every routine returns an additive
//! perturbation such that `x + delta` is inside the epsilon ball and the
//! pixel range; the caller applies the final clamp again before metrics as
//! a hard invariant.

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use aegis_core::{PixelRange, Result};
use aegis_nn::{loss, Loss, Mode, Pipeline};

use crate::spec::{AttackParams, NormKind, Routine};

/// Run one gradient-family routine against a frozen pipeline.
pub fn perturb<P: Pipeline>(
    pipeline: &P,
    routine: Routine,
    loss: Loss,
    x: &Array2<f32>,
    targets: &[usize],
    params: &AttackParams,
    range: &PixelRange,
    rng: &mut StdRng,
) -> Result<Array2<f32>> {
    params.validate()?;
    match routine {
        Routine::Fgsm => fgsm(pipeline, loss, x, targets, params, range, rng),
        Routine::Rfgsm => rfgsm(pipeline, loss, x, targets, params, range, rng),
        Routine::Pgd
        | Routine::PgdEot
        | Routine::PgdEotNormalized
        | Routine::PgdEotSign => pgd(pipeline, routine, loss, x, targets, params, range, rng),
    }
}

fn fgsm<P: Pipeline>(
    pipeline: &P,
    loss: Loss,
    x: &Array2<f32>,
    targets: &[usize],
    params: &AttackParams,
    range: &PixelRange,
    rng: &mut StdRng,
) -> Result<Array2<f32>> {
    let grad = pipeline.input_gradient(x, targets, loss, Mode::Standard, rng)?;
    let delta = grad.mapv(|g| params.eps * g.signum());
    Ok(clamp_to_range(x, &delta, range))
}

/// Random sign start, then a single FGSM step; the two half-steps together
/// stay inside the epsilon ball.
fn rfgsm<P: Pipeline>(
    pipeline: &P,
    loss: Loss,
    x: &Array2<f32>,
    targets: &[usize],
    params: &AttackParams,
    range: &PixelRange,
    rng: &mut StdRng,
) -> Result<Array2<f32>> {
    let alpha = params.eps / 2.0;
    let mut delta = Array2::from_shape_fn(x.raw_dim(), |_| {
        let n: f32 = StandardNormal.sample(rng);
        alpha * n.signum()
    });
    let x_start = x + &delta;
    let grad = pipeline.input_gradient(&x_start, targets, loss, Mode::Standard, rng)?;
    delta.zip_mut_with(&grad, |d, &g| *d += (params.eps - alpha) * g.signum());
    project(&mut delta, params);
    Ok(clamp_to_range(x, &delta, range))
}

fn pgd<P: Pipeline>(
    pipeline: &P,
    routine: Routine,
    loss: Loss,
    x: &Array2<f32>,
    targets: &[usize],
    params: &AttackParams,
    range: &PixelRange,
    rng: &mut StdRng,
) -> Result<Array2<f32>> {
    let restarts = params.num_restarts.max(1);
    let mut best_delta = Array2::zeros(x.raw_dim());
    let mut best_loss = vec![f32::NEG_INFINITY; x.nrows()];

    for _ in 0..restarts {
        let mut delta = if params.random_start {
            random_start(x, params, rng)
        } else {
            Array2::zeros(x.raw_dim())
        };

        for _ in 0..params.num_steps {
            let adv = clamped_adv(x, &delta, range);
            let grad = attack_gradient(pipeline, routine, loss, &adv, targets, params, rng)?;
            let step = step_direction(&grad, routine, params);
            delta += &step;
            project(&mut delta, params);
            delta = clamp_to_range(x, &delta, range);
        }

        // keep the per-example worst case across restarts
        let adv = clamped_adv(x, &delta, range);
        let logits = pipeline.logits(&adv, Mode::Standard, rng)?;
        let losses = per_sample_loss(loss, &logits, targets);
        for (i, &l) in losses.iter().enumerate() {
            if l > best_loss[i] {
                best_loss[i] = l;
                best_delta.row_mut(i).assign(&delta.row(i));
            }
        }
    }
    Ok(best_delta)
}

/// One gradient estimate. Plain PGD takes a single deterministic pass; the
/// EOT variants average over stochastic passes.
fn attack_gradient<P: Pipeline>(
    pipeline: &P,
    routine: Routine,
    loss: Loss,
    x: &Array2<f32>,
    targets: &[usize],
    params: &AttackParams,
    rng: &mut StdRng,
) -> Result<Array2<f32>> {
    match routine {
        Routine::Pgd | Routine::Fgsm | Routine::Rfgsm => {
            pipeline.input_gradient(x, targets, loss, Mode::Standard, rng)
        }
        Routine::PgdEot | Routine::PgdEotNormalized | Routine::PgdEotSign => {
            let mut acc = pipeline.input_gradient(x, targets, loss, Mode::Stochastic, rng)?;
            for _ in 1..params.eot_size {
                acc += &pipeline.input_gradient(x, targets, loss, Mode::Stochastic, rng)?;
            }
            acc.mapv_inplace(|v| v / params.eot_size as f32);
            Ok(acc)
        }
    }
}

fn step_direction(grad: &Array2<f32>, routine: Routine, params: &AttackParams) -> Array2<f32> {
    match routine {
        Routine::PgdEot => grad.mapv(|g| params.step_size * g),
        Routine::PgdEotNormalized => {
            let mut out = grad.clone();
            for mut row in out.rows_mut() {
                let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm > 0.0 {
                    row.mapv_inplace(|v| params.step_size * v / norm);
                }
            }
            out
        }
        Routine::PgdEotSign => grad.mapv(|g| params.step_size * g.signum()),
        _ => match params.norm {
            NormKind::Inf => grad.mapv(|g| params.step_size * g.signum()),
            NormKind::L2 => {
                let mut out = grad.clone();
                for mut row in out.rows_mut() {
                    let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
                    if norm > 0.0 {
                        row.mapv_inplace(|v| params.step_size * v / norm);
                    }
                }
                out
            }
        },
    }
}

fn random_start(x: &Array2<f32>, params: &AttackParams, rng: &mut StdRng) -> Array2<f32> {
    match params.norm {
        NormKind::Inf => Array2::from_shape_fn(x.raw_dim(), |_| {
            rng.random_range(-params.eps..=params.eps)
        }),
        NormKind::L2 => {
            let mut delta = Array2::from_shape_fn(x.raw_dim(), |_| {
                let n: f32 = StandardNormal.sample(rng);
                n
            });
            for mut row in delta.rows_mut() {
                let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm > 0.0 {
                    let radius = params.eps * rng.random::<f32>();
                    row.mapv_inplace(|v| radius * v / norm);
                }
            }
            delta
        }
    }
}

/// Project the perturbation back into the epsilon ball.
fn project(delta: &mut Array2<f32>, params: &AttackParams) {
    match params.norm {
        NormKind::Inf => delta.mapv_inplace(|d| d.clamp(-params.eps, params.eps)),
        NormKind::L2 => {
            for mut row in delta.rows_mut() {
                let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm > params.eps && norm > 0.0 {
                    let scale = params.eps / norm;
                    row.mapv_inplace(|v| v * scale);
                }
            }
        }
    }
}

fn clamped_adv(x: &Array2<f32>, delta: &Array2<f32>, range: &PixelRange) -> Array2<f32> {
    let mut adv = x + delta;
    adv.mapv_inplace(|v| range.clamp(v));
    adv
}

/// Re-express the perturbation so the attacked image is inside the range.
fn clamp_to_range(x: &Array2<f32>, delta: &Array2<f32>, range: &PixelRange) -> Array2<f32> {
    clamped_adv(x, delta, range) - x
}

fn per_sample_loss(loss: Loss, logits: &Array2<f32>, targets: &[usize]) -> Vec<f32> {
    match loss {
        Loss::CrossEntropy => {
            let probs = loss::softmax_rows(logits);
            targets
                .iter()
                .enumerate()
                .map(|(i, &t)| -probs[[i, t]].max(1e-12).ln())
                .collect()
        }
        Loss::CarliniWagner => logits
            .axis_iter(Axis(0))
            .zip(targets)
            .map(|(row, &t)| {
                let mut best = f32::NEG_INFINITY;
                for (j, &z) in row.iter().enumerate() {
                    if j != t && z > best {
                        best = z;
                    }
                }
                best - row[t]
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_nn::Classifier;
    use ndarray::Array2;
    use rand::{Rng, SeedableRng};

    fn setup() -> (Classifier, Array2<f32>, Vec<usize>, StdRng) {
        let mut rng = StdRng::seed_from_u64(23);
        let clf = Classifier::new(&[10, 16, 4], None, &mut rng).unwrap();
        let x = Array2::from_shape_fn((6, 10), |_| rng.random::<f32>());
        let y = vec![0, 1, 2, 3, 0, 1];
        (clf, x, y, rng)
    }

    fn params(norm: NormKind) -> AttackParams {
        AttackParams {
            norm,
            eps: 0.05,
            step_size: 0.02,
            num_steps: 10,
            random_start: true,
            num_restarts: 2,
            eot_size: 3,
        }
    }

    #[test]
    fn test_perturbations_respect_the_linf_ball_and_range() {
        let (clf, x, y, mut rng) = setup();
        let range = PixelRange::default();
        for routine in [
            Routine::Fgsm,
            Routine::Rfgsm,
            Routine::Pgd,
            Routine::PgdEot,
            Routine::PgdEotNormalized,
            Routine::PgdEotSign,
        ] {
            let p = params(NormKind::Inf);
            let delta = perturb(
                &clf,
                routine,
                Loss::CrossEntropy,
                &x,
                &y,
                &p,
                &range,
                &mut rng,
            )
            .unwrap();
            for &d in delta.iter() {
                assert!(d.abs() <= p.eps + 1e-6, "{routine:?}: |{d}| > eps");
            }
            let adv = &x + &delta;
            for &v in adv.iter() {
                assert!((-1e-6..=1.0 + 1e-6).contains(&v), "{routine:?}: {v}");
            }
        }
    }

    #[test]
    fn test_l2_projection_bounds_the_norm() {
        let (clf, x, y, mut rng) = setup();
        let p = params(NormKind::L2);
        let delta = perturb(
            &clf,
            Routine::Pgd,
            Loss::CrossEntropy,
            &x,
            &y,
            &p,
            &PixelRange::default(),
            &mut rng,
        )
        .unwrap();
        for row in delta.rows() {
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!(norm <= p.eps + 1e-5, "norm {norm}");
        }
    }

    #[test]
    fn test_pgd_increases_the_loss() {
        let (clf, x, y, mut rng) = setup();
        let p = AttackParams {
            eps: 0.3,
            step_size: 0.05,
            num_steps: 20,
            ..params(NormKind::Inf)
        };
        let clean_logits = Pipeline::logits(&clf, &x, Mode::Standard, &mut rng).unwrap();
        let clean: f32 = per_sample_loss(Loss::CrossEntropy, &clean_logits, &y)
            .iter()
            .sum();
        let delta = perturb(
            &clf,
            Routine::Pgd,
            Loss::CrossEntropy,
            &x,
            &y,
            &p,
            &PixelRange::default(),
            &mut rng,
        )
        .unwrap();
        let adv = &x + &delta;
        let adv_logits = Pipeline::logits(&clf, &adv, Mode::Standard, &mut rng).unwrap();
        let attacked: f32 = per_sample_loss(Loss::CrossEntropy, &adv_logits, &y)
            .iter()
            .sum();
        assert!(attacked > clean, "attacked {attacked} <= clean {clean}");
    }

    #[test]
    fn test_zero_eps_means_zero_perturbation() {
        let (clf, x, y, mut rng) = setup();
        let p = AttackParams {
            eps: 0.0,
            ..params(NormKind::Inf)
        };
        let delta = perturb(
            &clf,
            Routine::Pgd,
            Loss::CrossEntropy,
            &x,
            &y,
            &p,
            &PixelRange::default(),
            &mut rng,
        )
        .unwrap();
        assert!(delta.iter().all(|&d| d.abs() < 1e-6));
    }
}
