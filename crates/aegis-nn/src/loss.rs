//! Losses used for training and for steering attacks. Each helper returns
//! the mean loss over the batch together with the gradient at the logits
//! (or at the reconstruction, for MSE), which is all an ascent or descent
//! step needs.

use ndarray::{Array2, Axis};

use aegis_core::{AegisError, Result};

/// Objective an attack ascends. Cross-entropy is the default; the
/// Carlini-Wagner margin is what the `CWlinf` family of methods swaps in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loss {
    CrossEntropy,
    CarliniWagner,
}

/// Row-wise softmax, shifted by the row max for stability.
pub fn softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    out
}

fn check_targets(logits: &Array2<f32>, targets: &[usize]) -> Result<()> {
    if logits.nrows() != targets.len() {
        return Err(AegisError::ShapeMismatch {
            expected: vec![logits.nrows()],
            got: vec![targets.len()],
        });
    }
    let classes = logits.ncols();
    if let Some(&bad) = targets.iter().find(|&&t| t >= classes) {
        return Err(AegisError::InvalidArgument(format!(
            "target class {bad} out of range for {classes} classes"
        )));
    }
    Ok(())
}

/// Mean cross-entropy and its gradient at the logits: `softmax - onehot`,
/// divided by the batch size.
pub fn cross_entropy_loss_grad(
    logits: &Array2<f32>,
    targets: &[usize],
) -> Result<(f32, Array2<f32>)> {
    check_targets(logits, targets)?;
    let n = logits.nrows() as f32;
    let probs = softmax_rows(logits);
    let mut loss = 0.0;
    let mut grad = probs;
    for (i, &t) in targets.iter().enumerate() {
        loss -= grad[[i, t]].max(1e-12).ln();
        grad[[i, t]] -= 1.0;
    }
    grad.mapv_inplace(|v| v / n);
    Ok((loss / n, grad))
}

/// Carlini-Wagner margin, `max_{j != y} z_j - z_y`, averaged over the batch.
/// Positive once the sample is misclassified; the gradient puts `+1` on the
/// strongest wrong class and `-1` on the true one.
pub fn carlini_wagner_loss_grad(
    logits: &Array2<f32>,
    targets: &[usize],
) -> Result<(f32, Array2<f32>)> {
    check_targets(logits, targets)?;
    let n = logits.nrows() as f32;
    let mut loss = 0.0;
    let mut grad = Array2::zeros(logits.raw_dim());
    for (i, &t) in targets.iter().enumerate() {
        let row = logits.row(i);
        let mut best = f32::NEG_INFINITY;
        let mut best_j = 0;
        for (j, &z) in row.iter().enumerate() {
            if j != t && z > best {
                best = z;
                best_j = j;
            }
        }
        loss += best - row[t];
        grad[[i, best_j]] += 1.0 / n;
        grad[[i, t]] -= 1.0 / n;
    }
    Ok((loss / n, grad))
}

pub fn loss_grad(loss: Loss, logits: &Array2<f32>, targets: &[usize]) -> Result<(f32, Array2<f32>)> {
    match loss {
        Loss::CrossEntropy => cross_entropy_loss_grad(logits, targets),
        Loss::CarliniWagner => carlini_wagner_loss_grad(logits, targets),
    }
}

/// Mean squared error and its gradient at the prediction.
pub fn mse_loss_grad(pred: &Array2<f32>, target: &Array2<f32>) -> Result<(f32, Array2<f32>)> {
    if pred.raw_dim() != target.raw_dim() {
        return Err(AegisError::ShapeMismatch {
            expected: target.shape().to_vec(),
            got: pred.shape().to_vec(),
        });
    }
    let diff = pred - target;
    let n = pred.len() as f32;
    let loss = diff.iter().map(|d| d * d).sum::<f32>() / n;
    let grad = diff.mapv(|d| 2.0 * d / n);
    Ok((loss, grad))
}

/// Top-1 predictions from logits (or averaged probabilities).
pub fn argmax_rows(scores: &Array2<f32>) -> Vec<usize> {
    scores
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(i, _)| i)
                .unwrap_or(0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let probs = softmax_rows(&array![[1.0_f32, 2.0, 3.0], [100.0, 100.0, 100.0]]);
        for row in probs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_cross_entropy_gradient_matches_finite_difference() {
        let logits = array![[0.2_f32, -0.4, 1.1], [2.0, 0.0, -1.0]];
        let targets = vec![2, 0];
        let (_, grad) = cross_entropy_loss_grad(&logits, &targets).unwrap();
        let eps = 1e-3_f32;
        for i in 0..2 {
            for j in 0..3 {
                let mut lp = logits.clone();
                lp[[i, j]] += eps;
                let mut lm = logits.clone();
                lm[[i, j]] -= eps;
                let (fp, _) = cross_entropy_loss_grad(&lp, &targets).unwrap();
                let (fm, _) = cross_entropy_loss_grad(&lm, &targets).unwrap();
                let numeric = (fp - fm) / (2.0 * eps);
                assert!((grad[[i, j]] - numeric).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn test_carlini_wagner_sign_tracks_misclassification() {
        // correctly classified: margin negative
        let (loss, _) = carlini_wagner_loss_grad(&array![[5.0_f32, 1.0, 0.0]], &[0]).unwrap();
        assert!(loss < 0.0);
        // misclassified: margin positive
        let (loss, _) = carlini_wagner_loss_grad(&array![[1.0_f32, 5.0, 0.0]], &[0]).unwrap();
        assert!(loss > 0.0);
    }

    #[test]
    fn test_target_out_of_range_is_rejected() {
        let err = cross_entropy_loss_grad(&array![[0.0_f32, 1.0]], &[2]).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_mse_of_identical_arrays_is_zero() {
        let x = array![[1.0_f32, 2.0]];
        let (loss, grad) = mse_loss_grad(&x, &x).unwrap();
        assert_eq!(loss, 0.0);
        assert_eq!(grad.sum(), 0.0);
    }
}
