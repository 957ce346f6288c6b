//! The learned dictionary and its single-archive persistence.

use aegis_core::{AegisError, PatchGeometry, Result};
use ndarray::{Array1, Array2};
use ndarray_npy::{NpzReader, NpzWriter};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use tracing::info;

/// Hyperparameters the dictionary was learned with. Persisted alongside
/// the atom matrix so a loaded dictionary is self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictParams {
    pub n_atoms: usize,
    /// Sparsity penalty (lasso weight) used during coding.
    pub alpha: f32,
    pub n_iter: usize,
    pub batch_size: usize,
    pub geometry: PatchGeometry,
    pub stride: usize,
    pub seed: u64,
}

/// A learned sparse dictionary.
///
/// Atoms are stored as rows, matching the solver's convention and the
/// on-disk layout. Downstream reconstruction code works with atoms as
/// columns; [`Dictionary::atoms_as_columns`] is the one place where the
/// transpose happens, and it must stay that way — transposing twice (or
/// not at all) silently reconstructs with a transposed basis.
#[derive(Debug, Clone, PartialEq)]
pub struct Dictionary {
    atoms: Array2<f32>,
    params: DictParams,
}

impl Dictionary {
    pub fn new(atoms: Array2<f32>, params: DictParams) -> Result<Self> {
        let (rows, cols) = atoms.dim();
        if rows != params.n_atoms || cols != params.geometry.flat_len() {
            return Err(AegisError::shape_mismatch(
                vec![params.n_atoms, params.geometry.flat_len()],
                vec![rows, cols],
            ));
        }
        Ok(Self { atoms, params })
    }

    /// Atom matrix in solver convention: one atom per row.
    pub fn atoms(&self) -> &Array2<f32> {
        &self.atoms
    }

    /// Atom matrix in consumer convention: one atom per column.
    pub fn atoms_as_columns(&self) -> Array2<f32> {
        self.atoms.t().as_standard_layout().to_owned()
    }

    pub fn params(&self) -> &DictParams {
        &self.params
    }

    pub fn n_atoms(&self) -> usize {
        self.params.n_atoms
    }

    pub fn atom_len(&self) -> usize {
        self.params.geometry.flat_len()
    }

    /// Write the atom matrix and hyperparameters to one `.npz` archive.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .map_err(|e| AegisError::Io(format!("create {}: {e}", path.display())))?;
        let mut npz = NpzWriter::new(file);

        npz.add_array("atoms.npy", &self.atoms)
            .map_err(|e| AegisError::Io(format!("write atoms: {e}")))?;

        let params_json = serde_json::to_vec(&self.params)
            .map_err(|e| AegisError::Io(format!("encode params: {e}")))?;
        let params_arr = Array1::from_vec(params_json);
        npz.add_array("params.npy", &params_arr)
            .map_err(|e| AegisError::Io(format!("write params: {e}")))?;

        npz.finish()
            .map_err(|e| AegisError::Io(format!("finish archive: {e}")))?;
        info!(path = %path.display(), atoms = self.params.n_atoms, "dictionary saved");
        Ok(())
    }

    /// Load a dictionary archive written by [`Dictionary::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| AegisError::Io(format!("open {}: {e}", path.display())))?;
        let mut npz = NpzReader::new(file)
            .map_err(|e| AegisError::Io(format!("read archive {}: {e}", path.display())))?;

        let atoms: Array2<f32> = npz
            .by_name("atoms.npy")
            .map_err(|e| AegisError::Io(format!("read atoms: {e}")))?;
        let params_arr: Array1<u8> = npz
            .by_name("params.npy")
            .map_err(|e| AegisError::Io(format!("read params: {e}")))?;
        let params: DictParams = serde_json::from_slice(params_arr.as_slice().unwrap_or(&[]))
            .map_err(|e| AegisError::Io(format!("decode params: {e}")))?;

        Self::new(atoms, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn sample_params() -> DictParams {
        DictParams {
            n_atoms: 4,
            alpha: 0.5,
            n_iter: 10,
            batch_size: 8,
            geometry: PatchGeometry::new(2, 2, 1),
            stride: 1,
            seed: 7,
        }
    }

    fn sample_dictionary() -> Dictionary {
        let atoms = Array::from_iter((0..16).map(|i| i as f32 * 0.1))
            .into_shape_with_order((4, 4))
            .unwrap();
        Dictionary::new(atoms, sample_params()).unwrap()
    }

    #[test]
    fn test_shape_checked_against_params() {
        let atoms = Array2::<f32>::zeros((3, 4));
        assert!(Dictionary::new(atoms, sample_params()).is_err());
    }

    #[test]
    fn test_atoms_as_columns_is_transpose() {
        let dict = sample_dictionary();
        let cols = dict.atoms_as_columns();
        assert_eq!(cols.shape(), &[4, 4]);
        assert_eq!(cols[[1, 2]], dict.atoms()[[2, 1]]);
        // One transpose exactly: transposing back recovers the rows.
        assert_eq!(cols.t().to_owned(), *dict.atoms());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.npz");

        let dict = sample_dictionary();
        dict.save(&path).unwrap();

        let loaded = Dictionary::load(&path).unwrap();
        assert_eq!(loaded, dict);
        assert_eq!(loaded.params().alpha, 0.5);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = Dictionary::load(Path::new("/nonexistent/dict.npz"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("I/O failure"), "{err}");
    }
}
