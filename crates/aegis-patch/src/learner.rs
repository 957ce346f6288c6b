//! Mini-batch online dictionary learning.
//!
//! The solver follows the online scheme of Mairal et al.: each mini-batch
//! of flattened patches is sparse-coded against the current atoms with a
//! fixed number of ISTA iterations, sufficient statistics are accumulated,
//! and the atoms are refreshed by block-coordinate descent with
//! renormalization. `partial_fit` consumes one mini-batch; `fit` chunks a
//! materialized patch set and drives the same path.

use aegis_core::{AegisError, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info};

/// Number of ISTA iterations per patch. Enough for the codes to settle at
/// the patch sizes this crate works with.
const CODING_ITERS: usize = 30;

/// Diagonal threshold below which an atom is considered unused and gets
/// re-seeded instead of updated.
const DEAD_ATOM_EPS: f32 = 1e-8;

pub struct MiniBatchDictLearner {
    /// (n_atoms, dim); one atom per row, kept at unit norm or below.
    atoms: Array2<f32>,
    /// Accumulated code Gram matrix, (n_atoms, n_atoms).
    stat_a: Array2<f32>,
    /// Accumulated code/patch cross terms, (n_atoms, dim).
    stat_b: Array2<f32>,
    alpha: f32,
    seen_batches: usize,
    rng: StdRng,
    pool: rayon::ThreadPool,
}

impl MiniBatchDictLearner {
    /// Create a solver with randomly seeded unit-norm atoms.
    ///
    /// `n_jobs` sizes the solver-internal worker pool used for parallel
    /// sparse coding; batches themselves are always processed sequentially.
    pub fn new(n_atoms: usize, dim: usize, alpha: f32, n_jobs: usize, seed: u64) -> Result<Self> {
        if n_atoms == 0 || dim == 0 {
            return Err(AegisError::InvalidArgument(
                "dictionary needs at least one atom and one dimension".into(),
            ));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut atoms = Array2::<f32>::zeros((n_atoms, dim));
        for mut row in atoms.rows_mut() {
            for v in row.iter_mut() {
                *v = rng.random_range(-1.0..1.0);
            }
            normalize_row(&mut row);
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_jobs)
            .build()
            .map_err(|e| AegisError::InvalidArgument(format!("worker pool: {e}")))?;
        Ok(Self {
            atoms,
            stat_a: Array2::zeros((n_atoms, n_atoms)),
            stat_b: Array2::zeros((n_atoms, dim)),
            alpha,
            seen_batches: 0,
            rng,
            pool,
        })
    }

    pub fn n_atoms(&self) -> usize {
        self.atoms.nrows()
    }

    pub fn dim(&self) -> usize {
        self.atoms.ncols()
    }

    /// Atom matrix in solver convention (rows are atoms).
    pub fn components(&self) -> &Array2<f32> {
        &self.atoms
    }

    pub fn batches_seen(&self) -> usize {
        self.seen_batches
    }

    /// One incremental update from a mini-batch of flattened patches,
    /// shape `(batch, dim)`.
    pub fn partial_fit(&mut self, patches: &Array2<f32>) -> Result<()> {
        if patches.ncols() != self.dim() {
            return Err(AegisError::shape_mismatch(
                vec![patches.nrows(), self.dim()],
                vec![patches.nrows(), patches.ncols()],
            ));
        }
        if patches.nrows() == 0 {
            return Ok(());
        }

        let codes = self.sparse_code_batch(patches);

        // Sufficient statistics: A += C^T C, B += C^T X.
        self.stat_a = &self.stat_a + &codes.t().dot(&codes);
        self.stat_b = &self.stat_b + &codes.t().dot(patches);
        self.seen_batches += 1;

        self.update_atoms();

        debug!(
            batch = self.seen_batches,
            patches = patches.nrows(),
            "dictionary partial fit"
        );
        Ok(())
    }

    /// Batch mode: shuffle the full patch set once and stream it through
    /// `partial_fit` for `n_iter` chunk updates.
    pub fn fit(&mut self, patches: &Array2<f32>, n_iter: usize, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(AegisError::InvalidArgument("batch size must be positive".into()));
        }
        let n = patches.nrows();
        let mut order: Vec<usize> = (0..n).collect();
        for i in (1..n).rev() {
            let j = self.rng.random_range(0..=i);
            order.swap(i, j);
        }

        for iter in 0..n_iter {
            let start = (iter * batch_size) % n.max(1);
            let idx: Vec<usize> = (0..batch_size.min(n))
                .map(|k| order[(start + k) % n])
                .collect();
            let chunk = patches.select(Axis(0), &idx);
            self.partial_fit(&chunk)?;
        }
        info!(iters = n_iter, patches = n, "batch dictionary fit complete");
        Ok(())
    }

    /// Sparse-code every patch of the batch in parallel.
    fn sparse_code_batch(&self, patches: &Array2<f32>) -> Array2<f32> {
        let gram = self.atoms.dot(&self.atoms.t());
        // Lipschitz bound for the ISTA step from the Gram's max row sum.
        let lip = gram
            .rows()
            .into_iter()
            .map(|r| r.iter().map(|v| v.abs()).sum::<f32>())
            .fold(1.0_f32, f32::max);
        let step = 1.0 / lip;

        let rows: Vec<Array1<f32>> = self.pool.install(|| {
            patches
                .rows()
                .into_iter()
                .collect::<Vec<_>>()
                .into_par_iter()
                .map(|x| self.sparse_code_one(&x, &gram, step))
                .collect()
        });

        let mut codes = Array2::<f32>::zeros((patches.nrows(), self.n_atoms()));
        for (mut out, row) in codes.rows_mut().into_iter().zip(rows) {
            out.assign(&row);
        }
        codes
    }

    /// ISTA for one patch: c <- soft(c - step * (G c - D x), step * alpha).
    fn sparse_code_one(
        &self,
        x: &ArrayView1<f32>,
        gram: &Array2<f32>,
        step: f32,
    ) -> Array1<f32> {
        let corr = self.atoms.dot(x);
        let mut code = Array1::<f32>::zeros(self.n_atoms());
        let threshold = step * self.alpha;
        for _ in 0..CODING_ITERS {
            let grad = gram.dot(&code) - &corr;
            code = &code - &(grad * step);
            code.mapv_inplace(|v| soft_threshold(v, threshold));
        }
        code
    }

    /// Block-coordinate atom refresh from the accumulated statistics.
    fn update_atoms(&mut self) {
        let k = self.n_atoms();
        for j in 0..k {
            let ajj = self.stat_a[[j, j]];
            if ajj <= DEAD_ATOM_EPS {
                // Unused atom: re-seed rather than divide by ~zero.
                let mut row = self.atoms.row_mut(j);
                for v in row.iter_mut() {
                    *v = self.rng.random_range(-1.0..1.0);
                }
                normalize_row(&mut row);
                continue;
            }
            let residual = &self.stat_b.row(j) - &self.stat_a.row(j).dot(&self.atoms);
            let mut row = self.atoms.row_mut(j);
            let update = &row + &(&residual / ajj);
            row.assign(&update);
            // Project onto the unit ball (not forced to the sphere).
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 1.0 {
                row.mapv_inplace(|v| v / norm);
            }
        }
    }
}

#[inline]
fn soft_threshold(v: f32, t: f32) -> f32 {
    if v > t {
        v - t
    } else if v < -t {
        v + t
    } else {
        0.0
    }
}

fn normalize_row(row: &mut ndarray::ArrayViewMut1<f32>) {
    let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-12);
    row.mapv_inplace(|v| v / norm);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    /// Patches generated as sparse combinations of a planted basis.
    fn planted_patches(n: usize, dim: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut basis = Array2::<f32>::zeros((4, dim));
        for mut row in basis.rows_mut() {
            for v in row.iter_mut() {
                *v = rng.random_range(-1.0..1.0);
            }
            normalize_row(&mut row);
        }
        let mut patches = Array2::<f32>::zeros((n, dim));
        for mut row in patches.rows_mut() {
            let a = rng.random_range(0..4);
            let scale: f32 = rng.random_range(0.5..1.5);
            row.assign(&(&basis.row(a) * scale));
        }
        patches
    }

    fn reconstruction_error(learner: &MiniBatchDictLearner, patches: &Array2<f32>) -> f32 {
        let codes = learner.sparse_code_batch(patches);
        let recon = codes.dot(learner.components());
        let diff = patches - &recon;
        diff.iter().map(|v| v * v).sum::<f32>() / patches.nrows() as f32
    }

    #[test]
    fn test_soft_threshold() {
        assert_eq!(soft_threshold(0.5, 1.0), 0.0);
        assert_eq!(soft_threshold(-0.5, 1.0), 0.0);
        assert!((soft_threshold(2.0, 0.5) - 1.5).abs() < 1e-6);
        assert!((soft_threshold(-2.0, 0.5) + 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_atoms_start_unit_norm() {
        let learner = MiniBatchDictLearner::new(8, 12, 0.1, 1, 3).unwrap();
        for row in learner.components().rows() {
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_partial_fit_reduces_reconstruction_error() {
        let patches = planted_patches(200, 16, 11);
        let mut learner = MiniBatchDictLearner::new(8, 16, 0.05, 1, 42).unwrap();
        let before = reconstruction_error(&learner, &patches);
        for chunk in patches.axis_chunks_iter(Axis(0), 20) {
            learner.partial_fit(&chunk.to_owned()).unwrap();
        }
        let after = reconstruction_error(&learner, &patches);
        assert!(
            after < before,
            "error did not decrease: {before} -> {after}"
        );
        assert_eq!(learner.batches_seen(), 10);
    }

    #[test]
    fn test_fit_is_deterministic_for_a_seed() {
        let patches = planted_patches(100, 12, 5);
        let run = |seed| {
            let mut l = MiniBatchDictLearner::new(6, 12, 0.05, 1, seed).unwrap();
            l.fit(&patches, 20, 16).unwrap();
            l.components().clone()
        };
        assert_eq!(run(9), run(9));
    }

    #[test]
    fn test_dim_mismatch_rejected() {
        let mut learner = MiniBatchDictLearner::new(4, 8, 0.1, 1, 0).unwrap();
        let wrong = Array::zeros((3, 9));
        assert!(learner.partial_fit(&wrong).is_err());
    }

    #[test]
    fn test_high_alpha_gives_sparse_codes() {
        let patches = planted_patches(50, 16, 2);
        let mut learner = MiniBatchDictLearner::new(8, 16, 5.0, 1, 1).unwrap();
        learner.partial_fit(&patches).unwrap();
        let codes = learner.sparse_code_batch(&patches);
        let nonzero = codes.iter().filter(|v| v.abs() > 1e-9).count();
        // Heavy penalty should zero out the bulk of the coefficients.
        assert!(nonzero < codes.len() / 2, "{nonzero} of {}", codes.len());
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let mut learner = MiniBatchDictLearner::new(4, 8, 0.1, 1, 0).unwrap();
        let before = learner.components().clone();
        learner.partial_fit(&Array2::zeros((0, 8))).unwrap();
        assert_eq!(*learner.components(), before);
        assert_eq!(learner.batches_seen(), 0);
    }
}
