//! Persistence of attacked image batches: one dense `.npy` in test-set
//! order, with gzip-transparent reads so dumps can be stored compressed.

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use ndarray::Array2;
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use tracing::info;

use aegis_core::{AegisError, Result};

pub fn save_adversarial(images: &Array2<f32>, path: &Path) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| AegisError::Io(format!("failed to create {}: {e}", path.display())))?;
    images
        .write_npy(file)
        .map_err(|e| AegisError::Io(format!("failed to write npy: {e}")))?;
    info!(path = %path.display(), images = images.nrows(), "saved adversarial batch");
    Ok(())
}

/// Load a persisted adversarial batch; `.gz` files are decompressed on the
/// fly.
pub fn load_adversarial(path: &Path) -> Result<Array2<f32>> {
    let bytes = read_bytes_maybe_gzip(path)?;
    Array2::<f32>::read_npy(Cursor::new(bytes))
        .map_err(|e| AegisError::Io(format!("failed to read npy {}: {e}", path.display())))
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
