//! CIFAR-10 binary-format reader. Each record is one label byte followed by
//! 3072 pixel bytes in CHW order; pixels are scaled to `[0, 1]` on load.
//! Files may be stored gzipped with a `.gz` suffix.

use flate2::read::GzDecoder;
use ndarray::Array4;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::info;

use aegis_core::{AegisError, Result};

use crate::dataset::Dataset;

pub const CIFAR_CHANNELS: usize = 3;
pub const CIFAR_SIDE: usize = 32;
pub const CIFAR_CLASSES: usize = 10;
const RECORD_LEN: usize = 1 + CIFAR_CHANNELS * CIFAR_SIDE * CIFAR_SIDE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cifar10Split {
    Train,
    Test,
}

impl Cifar10Split {
    fn file_stems(&self) -> Vec<String> {
        match self {
            Cifar10Split::Train => (1..=5).map(|i| format!("data_batch_{i}.bin")).collect(),
            Cifar10Split::Test => vec!["test_batch.bin".to_string()],
        }
    }
}

fn resolve(root: &Path, stem: &str) -> Result<PathBuf> {
    let plain = root.join(stem);
    if plain.exists() {
        return Ok(plain);
    }
    let gz = root.join(format!("{stem}.gz"));
    if gz.exists() {
        return Ok(gz);
    }
    Err(AegisError::Io(format!(
        "file not found: {} (also tried .gz)",
        plain.display()
    )))
}

fn read_bytes_maybe_gzip(path: &Path) -> Result<Vec<u8>> {
    let is_gzip = path.extension().and_then(|e| e.to_str()) == Some("gz");
    if !is_gzip {
        return std::fs::read(path)
            .map_err(|e| AegisError::Io(format!("failed to read {}: {e}", path.display())));
    }
    let file = File::open(path)
        .map_err(|e| AegisError::Io(format!("failed to open {}: {e}", path.display())))?;
    let mut decoder = GzDecoder::new(file);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| AegisError::Io(format!("failed to decode gzip: {e}")))?;
    Ok(out)
}

/// Load a CIFAR-10 split from the binary-version directory.
pub fn load_cifar10(root: &Path, split: Cifar10Split) -> Result<Dataset> {
    let mut pixels: Vec<f32> = Vec::new();
    let mut labels: Vec<usize> = Vec::new();

    for stem in split.file_stems() {
        let path = resolve(root, &stem)?;
        let bytes = read_bytes_maybe_gzip(&path)?;
        if bytes.is_empty() || bytes.len() % RECORD_LEN != 0 {
            return Err(AegisError::Io(format!(
                "{}: length {} is not a multiple of the {RECORD_LEN}-byte record",
                path.display(),
                bytes.len()
            )));
        }
        for record in bytes.chunks_exact(RECORD_LEN) {
            let label = record[0] as usize;
            if label >= CIFAR_CLASSES {
                return Err(AegisError::Io(format!(
                    "{}: label {label} out of range",
                    path.display()
                )));
            }
            labels.push(label);
            pixels.extend(record[1..].iter().map(|&b| b as f32 / 255.0));
        }
    }

    let n = labels.len();
    let images = Array4::from_shape_vec((n, CIFAR_CHANNELS, CIFAR_SIDE, CIFAR_SIDE), pixels)
        .map_err(|e| AegisError::Io(format!("bad pixel buffer: {e}")))?;
    info!(images = n, split = ?split, "loaded cifar10");
    Dataset::new(images, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn write_records(path: &Path, records: &[(u8, u8)]) {
        // each record: label byte, then 3072 copies of a fill byte
        let mut buf = Vec::new();
        for &(label, fill) in records {
            buf.push(label);
            buf.extend(std::iter::repeat_n(fill, RECORD_LEN - 1));
        }
        std::fs::write(path, buf).unwrap();
    }

    #[test]
    fn test_reads_labels_and_scales_pixels() {
        let dir = tempfile::tempdir().unwrap();
        write_records(&dir.path().join("test_batch.bin"), &[(3, 255), (7, 0)]);
        let ds = load_cifar10(dir.path(), Cifar10Split::Test).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.labels, vec![3, 7]);
        assert_eq!(ds.images[[0, 0, 0, 0]], 1.0);
        assert_eq!(ds.images[[1, 2, 31, 31]], 0.0);
    }

    #[test]
    fn test_gzipped_files_are_transparent() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = vec![1_u8];
        raw.extend(std::iter::repeat_n(128, RECORD_LEN - 1));
        let file = File::create(dir.path().join("test_batch.bin.gz")).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(&raw).unwrap();
        enc.finish().unwrap();

        let ds = load_cifar10(dir.path(), Cifar10Split::Test).unwrap();
        assert_eq!(ds.labels, vec![1]);
        assert!((ds.images[[0, 0, 0, 0]] - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test_batch.bin"), vec![0_u8; 100]).unwrap();
        let err = load_cifar10(dir.path(), Cifar10Split::Test).unwrap_err();
        assert!(err.to_string().contains("record"));
    }

    #[test]
    fn test_missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_cifar10(dir.path(), Cifar10Split::Test).unwrap_err();
        assert!(err.to_string().contains("test_batch.bin"));
    }
}
