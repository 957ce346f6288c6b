//! Model checkpoints as single `.npz` archives: one entry per weight tensor
//! plus a JSON metadata blob stored as raw bytes, same scheme the patch
//! dictionary uses.

use std::fs::File;
use std::path::Path;

use ndarray::{Array1, Array2};
use ndarray_npy::{NpzReader, NpzWriter};
use serde::{Deserialize, Serialize};
use tracing::info;

use aegis_core::{AegisError, Result};

use crate::autoencoder::{SparseAutoencoder, SparsifierBackward};
use crate::classifier::Classifier;
use crate::layers::Dense;

#[derive(Serialize, Deserialize)]
struct AeMeta {
    top_k: usize,
    backward: SparsifierBackward,
    dropout: Option<f32>,
}

#[derive(Serialize, Deserialize)]
struct ClfMeta {
    n_layers: usize,
    dropout: Option<f32>,
}

fn npz_err(e: impl std::fmt::Display) -> AegisError {
    AegisError::Io(format!("npz: {e}"))
}

fn write_meta<T: Serialize>(npz: &mut NpzWriter<File>, meta: &T) -> Result<()> {
    let bytes = serde_json::to_vec(meta)
        .map_err(|e| AegisError::Io(format!("encode metadata: {e}")))?;
    let arr = Array1::from_vec(bytes);
    npz.add_array("meta.npy", &arr).map_err(npz_err)
}

fn read_meta<T: for<'de> Deserialize<'de>>(npz: &mut NpzReader<File>) -> Result<T> {
    let arr: Array1<u8> = npz.by_name("meta.npy").map_err(npz_err)?;
    serde_json::from_slice(arr.as_slice().unwrap_or(&[]))
        .map_err(|e| AegisError::Io(format!("decode metadata: {e}")))
}

pub fn save_autoencoder(ae: &SparseAutoencoder, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    let mut npz = NpzWriter::new(file);
    npz.add_array("enc_w.npy", &ae.encoder.w).map_err(npz_err)?;
    npz.add_array("enc_b.npy", &ae.encoder.b).map_err(npz_err)?;
    npz.add_array("dec_w.npy", &ae.decoder.w).map_err(npz_err)?;
    npz.add_array("dec_b.npy", &ae.decoder.b).map_err(npz_err)?;
    write_meta(
        &mut npz,
        &AeMeta {
            top_k: ae.top_k(),
            backward: ae.backward_variant(),
            dropout: ae.dropout(),
        },
    )?;
    npz.finish().map_err(npz_err)?;
    info!(path = %path.display(), "saved autoencoder checkpoint");
    Ok(())
}

/// Load an autoencoder checkpoint. `backward` overrides the stored
/// sparsifier backward variant when given; attacks use this to pick the
/// straight-through treatment without retraining.
pub fn load_autoencoder(
    path: &Path,
    backward: Option<SparsifierBackward>,
) -> Result<SparseAutoencoder> {
    let file = File::open(path)?;
    let mut npz = NpzReader::new(file).map_err(npz_err)?;
    let enc_w: Array2<f32> = npz.by_name("enc_w.npy").map_err(npz_err)?;
    let enc_b: Array1<f32> = npz.by_name("enc_b.npy").map_err(npz_err)?;
    let dec_w: Array2<f32> = npz.by_name("dec_w.npy").map_err(npz_err)?;
    let dec_b: Array1<f32> = npz.by_name("dec_b.npy").map_err(npz_err)?;
    let meta: AeMeta = read_meta(&mut npz)?;
    SparseAutoencoder::from_parts(
        Dense::from_parts(enc_w, enc_b)?,
        Dense::from_parts(dec_w, dec_b)?,
        meta.top_k,
        backward.unwrap_or(meta.backward),
        meta.dropout,
    )
}

pub fn save_classifier(clf: &Classifier, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    let mut npz = NpzWriter::new(file);
    for (i, layer) in clf.dense_layers().iter().enumerate() {
        npz.add_array(format!("w{i}.npy"), &layer.w).map_err(npz_err)?;
        npz.add_array(format!("b{i}.npy"), &layer.b).map_err(npz_err)?;
    }
    write_meta(
        &mut npz,
        &ClfMeta {
            n_layers: clf.dense_layers().len(),
            dropout: clf.dropout_p(),
        },
    )?;
    npz.finish().map_err(npz_err)?;
    info!(path = %path.display(), "saved classifier checkpoint");
    Ok(())
}

pub fn load_classifier(path: &Path) -> Result<Classifier> {
    let file = File::open(path)?;
    let mut npz = NpzReader::new(file).map_err(npz_err)?;
    let meta: ClfMeta = read_meta(&mut npz)?;
    let mut layers = Vec::with_capacity(meta.n_layers);
    for i in 0..meta.n_layers {
        let w: Array2<f32> = npz.by_name(&format!("w{i}.npy")).map_err(npz_err)?;
        let b: Array1<f32> = npz.by_name(&format!("b{i}.npy")).map_err(npz_err)?;
        layers.push(Dense::from_parts(w, b)?);
    }
    Classifier::from_layers(layers, meta.dropout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::layers::Mode;

    #[test]
    fn test_autoencoder_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ae.npz");
        let mut rng = StdRng::seed_from_u64(21);
        let ae = SparseAutoencoder::new(6, 9, 3, SparsifierBackward::Exact, Some(0.1), &mut rng)
            .unwrap();
        save_autoencoder(&ae, &path).unwrap();

        let loaded = load_autoencoder(&path, None).unwrap();
        assert_eq!(loaded.encoder.w, ae.encoder.w);
        assert_eq!(loaded.decoder.b, ae.decoder.b);
        assert_eq!(loaded.top_k(), 3);
        assert_eq!(loaded.backward_variant(), SparsifierBackward::Exact);
        assert_eq!(loaded.dropout(), Some(0.1));
    }

    #[test]
    fn test_backward_override_applies_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ae.npz");
        let mut rng = StdRng::seed_from_u64(2);
        let ae =
            SparseAutoencoder::new(6, 9, 3, SparsifierBackward::Exact, None, &mut rng).unwrap();
        save_autoencoder(&ae, &path).unwrap();
        let loaded = load_autoencoder(&path, Some(SparsifierBackward::Identity)).unwrap();
        assert_eq!(loaded.backward_variant(), SparsifierBackward::Identity);
    }

    #[test]
    fn test_classifier_round_trips_and_predicts_the_same() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clf.npz");
        let mut rng = StdRng::seed_from_u64(13);
        let clf = Classifier::new(&[5, 8, 3], None, &mut rng).unwrap();
        save_classifier(&clf, &path).unwrap();
        let loaded = load_classifier(&path).unwrap();

        let x = Array2::from_shape_fn((4, 5), |_| rng.random::<f32>());
        let a = clf.logits(&x, Mode::Standard, &mut rng).unwrap();
        let b = loaded.logits(&x, Mode::Standard, &mut rng).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let err = load_autoencoder(Path::new("/nonexistent/ae.npz"), None).unwrap_err();
        assert!(matches!(err, AegisError::Io(_)));
    }
}
