//! Run-file names derived from hyperparameters, so artifacts from different
//! configurations never collide and a rerun with the same flags finds its
//! own outputs.

use aegis_core::PatchGeometry;
use aegis_data::DatasetKind;

fn fmt_f32(v: f32) -> String {
    // 0.05 -> "0.05", 1.0 -> "1"
    let s = format!("{v}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

pub fn dictionary_file(
    dataset: DatasetKind,
    n_atoms: usize,
    geometry: &PatchGeometry,
    stride: usize,
    alpha: f32,
) -> String {
    format!(
        "{}_dict_k{}_p{}x{}x{}_s{}_a{}.npz",
        dataset.name(),
        n_atoms,
        geometry.height,
        geometry.width,
        geometry.channels,
        stride,
        fmt_f32(alpha)
    )
}

pub fn autoencoder_file(
    dataset: DatasetKind,
    n_atoms: usize,
    top_k: usize,
    optimizer: &str,
    lr: f32,
    epochs: usize,
) -> String {
    format!(
        "{}_ae_k{}_t{}_{}_lr{}_e{}.npz",
        dataset.name(),
        n_atoms,
        top_k,
        optimizer,
        fmt_f32(lr),
        epochs
    )
}

pub fn attack_file(
    dataset: DatasetKind,
    method: &str,
    box_token: &str,
    eps: f32,
    num_steps: usize,
    budget: usize,
) -> String {
    format!(
        "{}_{}_{}_eps{}_n{}_b{}.npy",
        dataset.name(),
        method,
        box_token,
        fmt_f32(eps),
        num_steps,
        budget
    )
}

/// Per-run log-file name: the artifact's stem plus a timestamp, so reruns
/// with the same flags keep their histories apart.
pub fn log_file(artifact: &str, epoch_secs: u64) -> String {
    let stem = artifact.rsplit_once('.').map_or(artifact, |(stem, _)| stem);
    format!("{stem}_{epoch_secs}.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_encode_the_hyperparameters() {
        let g = PatchGeometry {
            height: 6,
            width: 6,
            channels: 3,
        };
        assert_eq!(
            dictionary_file(DatasetKind::Cifar10, 500, &g, 3, 1.0),
            "cifar10_dict_k500_p6x6x3_s3_a1.npz"
        );
        assert_eq!(
            autoencoder_file(DatasetKind::Cifar10, 500, 20, "adam", 0.001, 50),
            "cifar10_ae_k500_t20_adam_lr0.001_e50.npz"
        );
        assert_eq!(
            attack_file(DatasetKind::Synthetic, "CWlinf-PGD", "white", 0.05, 40, 1000),
            "synthetic_CWlinf-PGD_white_eps0.05_n40_b1000.npy"
        );
    }

    #[test]
    fn test_different_settings_give_different_names() {
        let g = PatchGeometry {
            height: 4,
            width: 4,
            channels: 3,
        };
        let a = dictionary_file(DatasetKind::Cifar10, 100, &g, 2, 0.5);
        let b = dictionary_file(DatasetKind::Cifar10, 200, &g, 2, 0.5);
        assert_ne!(a, b);
    }

    #[test]
    fn test_log_name_shares_the_artifact_stem() {
        assert_eq!(
            log_file("cifar10_ae_k500_t20_adam_lr0.001_e50.npz", 1700000000),
            "cifar10_ae_k500_t20_adam_lr0.001_e50_1700000000.log"
        );
        assert_eq!(log_file("bare", 5), "bare_5.log");
    }
}
