//! aegis CLI
//!
//! Command-line front end for the sparse-dictionary defense bench.
//!
//! # Commands
//!
//! - `aegis learn-dict` - Learn (or load) a patch dictionary from a dataset
//! - `aegis train-ae` - Train the sparse autoencoder defense
//! - `aegis attack` - Run an adversarial attack and report robust accuracy

mod namers;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use ndarray::s;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use aegis_attack::{
    run_attack, AttackConfig, AttackMethod, AttackParams, BoundaryParams, BoxKind, NormKind,
    OtherboxKind, WhiteboxKind,
};
use aegis_core::{AegisError, ChannelOrder, PatchGeometry};
use aegis_data::{Cifar10Split, DatasetKind};
use aegis_nn::checkpoint::{load_autoencoder, load_classifier, save_autoencoder};
use aegis_nn::{
    train_autoencoder, Combined, CombinedOuterBpda, EnsemblePostSoftmax, OptimizerSpec, Pipeline,
    SchedulerSpec, SparseAutoencoder, SparsifierBackward, TrainConfig,
};
use aegis_patch::{
    learn_dictionary, Backend, DictLearnConfig, DictMode, DictParams, Dictionary, ImageBatch,
};

#[derive(Parser)]
#[command(name = "aegis")]
#[command(about = "Sparse-dictionary defenses and adversarial attacks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Learn a patch dictionary from the training split
    LearnDict {
        /// Dataset: cifar10 or synthetic
        dataset: String,
        /// Directory holding the dataset files
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Directory for run artifacts
        #[arg(long, default_value = "runs")]
        out_dir: PathBuf,
        /// Number of dictionary atoms
        #[arg(long, default_value_t = 500)]
        n_atoms: usize,
        /// Sparsity weight of the coding step
        #[arg(long, default_value_t = 1.0)]
        alpha: f32,
        /// Square patch side length
        #[arg(long, default_value_t = 6)]
        patch_size: usize,
        /// Sliding-window stride
        #[arg(long, default_value_t = 3)]
        stride: usize,
        /// Passes over the patch set (batch mode)
        #[arg(long, default_value_t = 10)]
        iterations: usize,
        /// Solver mini-batch size
        #[arg(long, default_value_t = 512)]
        batch_size: usize,
        /// Feeding mode: online or batch
        #[arg(long, default_value = "online")]
        mode: String,
        /// Extraction backend: gather or unfold
        #[arg(long, default_value = "gather")]
        backend: String,
        /// Solver worker threads
        #[arg(long, default_value_t = 4)]
        jobs: usize,
        /// Cap on training images
        #[arg(long)]
        images: Option<usize>,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Train the sparse autoencoder defense
    TrainAe {
        /// Dataset: cifar10 or synthetic
        dataset: String,
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[arg(long, default_value = "runs")]
        out_dir: PathBuf,
        /// Warm-start encoder/decoder from a learned dictionary
        #[arg(long)]
        dict: Option<PathBuf>,
        /// Atom count for random initialization (ignored with --dict)
        #[arg(long, default_value_t = 500)]
        n_atoms: usize,
        /// Active units kept by the sparsifier
        #[arg(long, default_value_t = 20)]
        top_k: usize,
        /// Dropout probability on the code
        #[arg(long)]
        dropout: Option<f32>,
        #[arg(long, default_value_t = 50)]
        epochs: usize,
        /// Optimizer: sgd, rms or adam
        #[arg(long, default_value = "adam")]
        optimizer: String,
        /// Override the optimizer's default learning rate
        #[arg(long)]
        lr: Option<f32>,
        /// Scheduler: cyc, step or mult
        #[arg(long)]
        scheduler: Option<String>,
        #[arg(long, default_value_t = 128)]
        batch_size: usize,
        /// Fraction of the training split held out for validation
        #[arg(long, default_value_t = 0.1)]
        val_fraction: f32,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Attack a pipeline and report clean/robust accuracy
    Attack {
        /// Dataset: cifar10 or synthetic
        dataset: String,
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[arg(long, default_value = "runs")]
        out_dir: PathBuf,
        /// Pretrained classifier checkpoint (.npz)
        #[arg(long)]
        classifier: PathBuf,
        /// Autoencoder checkpoint; omit to attack the bare classifier
        #[arg(long)]
        autoencoder: Option<PathBuf>,
        /// Treat the sparsifier as identity in the backward pass
        #[arg(long)]
        bpda_identity: bool,
        /// Method token, e.g. PGD, CWlinf-PGD, PGD-EOT-sign
        #[arg(long, default_value = "PGD")]
        method: String,
        /// Box type: white, white-outer, decision or transfer
        #[arg(long = "box", default_value = "white")]
        box_token: String,
        /// Perturbation norm: inf or l2
        #[arg(long, default_value = "inf")]
        norm: String,
        #[arg(long, default_value_t = 8.0 / 255.0)]
        eps: f32,
        #[arg(long, default_value_t = 2.0 / 255.0)]
        step_size: f32,
        #[arg(long, default_value_t = 20)]
        steps: usize,
        #[arg(long, default_value_t = 1)]
        restarts: usize,
        /// Stochastic passes per EOT gradient estimate
        #[arg(long, default_value_t = 8)]
        eot: usize,
        /// Post-softmax ensemble passes (1 disables ensembling)
        #[arg(long, default_value_t = 1)]
        ensemble: usize,
        /// Number of test examples to attack
        #[arg(long, default_value_t = 1000)]
        budget: usize,
        #[arg(long, default_value_t = 64)]
        batch_size: usize,
        /// Skip the clean-accuracy pass
        #[arg(long)]
        skip_clean: bool,
        /// Precomputed dump for the transfer box type
        #[arg(long)]
        transfer_from: Option<PathBuf>,
        /// Recompute without prompting when the output file exists
        #[arg(short = 'y', long)]
        yes: bool,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

/// Console logging, mirrored into a per-run log file when one is named.
fn init_logging(log_path: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_writer(io::stderr);
    match log_path {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let file = File::create(path)?;
            Registry::default()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .try_init()
                .ok();
        }
        None => {
            Registry::default().with(filter).with(console).try_init().ok();
        }
    }
    Ok(())
}

fn unix_stamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::LearnDict {
            dataset,
            data_dir,
            out_dir,
            n_atoms,
            alpha,
            patch_size,
            stride,
            iterations,
            batch_size,
            mode,
            backend,
            jobs,
            images,
            seed,
        } => cmd_learn_dict(
            &dataset, &data_dir, &out_dir, n_atoms, alpha, patch_size, stride, iterations,
            batch_size, &mode, &backend, jobs, images, seed,
        ),
        Commands::TrainAe {
            dataset,
            data_dir,
            out_dir,
            dict,
            n_atoms,
            top_k,
            dropout,
            epochs,
            optimizer,
            lr,
            scheduler,
            batch_size,
            val_fraction,
            seed,
        } => cmd_train_ae(
            &dataset,
            &data_dir,
            &out_dir,
            dict.as_deref(),
            n_atoms,
            top_k,
            dropout,
            epochs,
            &optimizer,
            lr,
            scheduler.as_deref(),
            batch_size,
            val_fraction,
            seed,
        ),
        Commands::Attack {
            dataset,
            data_dir,
            out_dir,
            classifier,
            autoencoder,
            bpda_identity,
            method,
            box_token,
            norm,
            eps,
            step_size,
            steps,
            restarts,
            eot,
            ensemble,
            budget,
            batch_size,
            skip_clean,
            transfer_from,
            yes,
            seed,
        } => cmd_attack(AttackArgs {
            dataset,
            data_dir,
            out_dir,
            classifier,
            autoencoder,
            bpda_identity,
            method,
            box_token,
            norm,
            eps,
            step_size,
            steps,
            restarts,
            eot,
            ensemble,
            budget,
            batch_size,
            skip_clean,
            transfer_from,
            yes,
            seed,
        }),
    }
}

fn parse_mode(s: &str) -> Result<DictMode, AegisError> {
    match s {
        "online" => Ok(DictMode::Online),
        "batch" => Ok(DictMode::Batch),
        other => Err(AegisError::UnsupportedConfig(format!(
            "mode not understood: {other}"
        ))),
    }
}

fn parse_backend(s: &str) -> Result<Backend, AegisError> {
    match s {
        "gather" => Ok(Backend::Gather),
        "unfold" => Ok(Backend::Unfold),
        other => Err(AegisError::UnsupportedConfig(format!(
            "backend not understood: {other}"
        ))),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_learn_dict(
    dataset: &str,
    data_dir: &Path,
    out_dir: &Path,
    n_atoms: usize,
    alpha: f32,
    patch_size: usize,
    stride: usize,
    iterations: usize,
    batch_size: usize,
    mode: &str,
    backend: &str,
    jobs: usize,
    images: Option<usize>,
    seed: u64,
) -> anyhow::Result<()> {
    init_logging(None)?;
    let kind: DatasetKind = dataset.parse()?;
    let mut ds = kind.load(data_dir, Cifar10Split::Train, seed)?;
    if let Some(n) = images {
        ds = ds.truncate(n);
    }
    let (channels, _, _) = ds.image_dims();
    let geometry = PatchGeometry {
        height: patch_size,
        width: patch_size,
        channels,
    };
    let params = DictParams {
        n_atoms,
        alpha,
        n_iter: iterations,
        batch_size,
        geometry,
        stride,
        seed,
    };
    let cfg = DictLearnConfig {
        params,
        mode: parse_mode(mode)?,
        n_jobs: jobs,
        backend: parse_backend(backend)?,
    };
    std::fs::create_dir_all(out_dir)?;
    let path = out_dir.join(namers::dictionary_file(kind, n_atoms, &geometry, stride, alpha));

    let images4 = ds.images;
    let n = images4.shape()[0];
    let chunk = 64usize;
    let dict = learn_dictionary(
        move || {
            (0..n.div_ceil(chunk)).map(move |b| {
                let lo = b * chunk;
                let hi = ((b + 1) * chunk).min(n);
                let slice = images4.slice(s![lo..hi, .., .., ..]).to_owned();
                Ok(ImageBatch::new(slice, ChannelOrder::Nchw))
            })
        },
        &cfg,
        &path,
    )?;
    info!(
        atoms = dict.n_atoms(),
        path = %path.display(),
        "dictionary ready"
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_train_ae(
    dataset: &str,
    data_dir: &Path,
    out_dir: &Path,
    dict: Option<&Path>,
    n_atoms: usize,
    top_k: usize,
    dropout: Option<f32>,
    epochs: usize,
    optimizer: &str,
    lr: Option<f32>,
    scheduler: Option<&str>,
    batch_size: usize,
    val_fraction: f32,
    seed: u64,
) -> anyhow::Result<()> {
    let kind: DatasetKind = dataset.parse()?;
    let mut spec: OptimizerSpec = optimizer.parse()?;
    if let Some(lr) = lr {
        spec = spec.with_lr(lr);
    }
    let sched = scheduler
        .map(|s| s.parse::<SchedulerSpec>())
        .transpose()?;

    let run_name = namers::autoencoder_file(kind, n_atoms, top_k, spec.name(), spec.lr(), epochs);
    let log_path = out_dir.join(namers::log_file(&run_name, unix_stamp()));
    init_logging(Some(&log_path))?;

    let ds = kind.load(data_dir, Cifar10Split::Train, seed)?;
    let flat = ds.flatten();
    let feature_len = ds.feature_len();

    if !(0.0..1.0).contains(&val_fraction) {
        anyhow::bail!("val fraction must be in [0, 1), got {val_fraction}");
    }
    let n_val = ((flat.nrows() as f32 * val_fraction) as usize).min(flat.nrows() - 1);
    let n_train = flat.nrows() - n_val;
    let train = flat.slice(s![..n_train, ..]).to_owned();
    let val = flat.slice(s![n_train.., ..]).to_owned();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut ae = match dict {
        Some(path) => {
            let dict = Dictionary::load(path)?;
            if dict.atom_len() != feature_len {
                anyhow::bail!(
                    "dictionary atoms have {} features but images flatten to {feature_len}; \
                     warm start needs whole-image patches",
                    dict.atom_len()
                );
            }
            SparseAutoencoder::from_dictionary(&dict, top_k, SparsifierBackward::Exact, dropout)?
        }
        None => SparseAutoencoder::new(
            feature_len,
            n_atoms,
            top_k,
            SparsifierBackward::Exact,
            dropout,
            &mut rng,
        )?,
    };

    let cfg = TrainConfig {
        epochs,
        optimizer: spec,
        scheduler: sched,
        seed,
    };
    let report = train_autoencoder(
        &mut ae,
        || batch_rows(&train, batch_size),
        || batch_rows(&val, batch_size),
        &cfg,
    )?;

    std::fs::create_dir_all(out_dir)?;
    let path = out_dir.join(namers::autoencoder_file(
        kind,
        ae.n_atoms(),
        top_k,
        spec.name(),
        spec.lr(),
        epochs,
    ));
    save_autoencoder(&ae, &path)?;
    if let (Some(first), Some(last)) = (report.train_losses.first(), report.train_losses.last()) {
        info!(first_epoch = first, last_epoch = last, "training loss");
    }
    Ok(())
}

fn batch_rows(
    data: &ndarray::Array2<f32>,
    batch_size: usize,
) -> impl Iterator<Item = aegis_core::Result<ndarray::Array2<f32>>> + '_ {
    let n = data.nrows();
    let bs = batch_size.max(1);
    (0..n.div_ceil(bs)).map(move |b| {
        let lo = b * bs;
        let hi = ((b + 1) * bs).min(n);
        Ok(data.slice(s![lo..hi, ..]).to_owned())
    })
}

struct AttackArgs {
    dataset: String,
    data_dir: PathBuf,
    out_dir: PathBuf,
    classifier: PathBuf,
    autoencoder: Option<PathBuf>,
    bpda_identity: bool,
    method: String,
    box_token: String,
    norm: String,
    eps: f32,
    step_size: f32,
    steps: usize,
    restarts: usize,
    eot: usize,
    ensemble: usize,
    budget: usize,
    batch_size: usize,
    skip_clean: bool,
    transfer_from: Option<PathBuf>,
    yes: bool,
    seed: u64,
}

/// The outer-module gradient skips the stochastic frontend entirely, so
/// extra EOT passes would only repeat the same deterministic pass.
fn resolve_eot(box_kind: BoxKind, eot: usize) -> usize {
    match box_kind {
        BoxKind::White(WhiteboxKind::OuterModule) => 1,
        _ => eot,
    }
}

fn cmd_attack(args: AttackArgs) -> anyhow::Result<()> {
    let kind: DatasetKind = args.dataset.parse()?;
    let method: AttackMethod = args.method.parse()?;
    let box_kind: BoxKind = args.box_token.parse()?;
    let params = AttackParams {
        norm: args.norm.parse::<NormKind>()?,
        eps: args.eps,
        step_size: args.step_size,
        num_steps: args.steps,
        random_start: true,
        num_restarts: args.restarts,
        eot_size: resolve_eot(box_kind, args.eot),
    };

    let run_name = namers::attack_file(
        kind,
        &args.method,
        &args.box_token,
        args.eps,
        args.steps,
        args.budget,
    );
    let log_path = args.out_dir.join(namers::log_file(&run_name, unix_stamp()));
    init_logging(Some(&log_path))?;

    let ds = kind.load(&args.data_dir, Cifar10Split::Test, args.seed)?;

    let backward = args.bpda_identity.then_some(SparsifierBackward::Identity);
    let clf = load_classifier(&args.classifier)?;
    let pipeline: Box<dyn Pipeline> = match (&args.autoencoder, box_kind) {
        (None, BoxKind::White(WhiteboxKind::OuterModule)) => {
            anyhow::bail!("white-outer needs an autoencoder frontend")
        }
        (None, _) => Box::new(clf),
        (Some(path), BoxKind::White(WhiteboxKind::OuterModule)) => {
            let ae = load_autoencoder(path, backward)?;
            Box::new(CombinedOuterBpda::new(ae, clf)?)
        }
        (Some(path), _) => {
            let ae = load_autoencoder(path, backward)?;
            Box::new(Combined::new(ae, clf)?)
        }
    };

    std::fs::create_dir_all(&args.out_dir)?;
    let out_path = args.out_dir.join(&run_name);

    let mut cfg = AttackConfig {
        method,
        box_kind,
        params,
        boundary: BoundaryParams::default(),
        budget: args.budget,
        batch_size: args.batch_size,
        skip_clean: args.skip_clean,
        save_path: Some(out_path.clone()),
        transfer_path: args.transfer_from,
        seed: args.seed,
    };

    let is_transfer = matches!(box_kind, BoxKind::Other(OtherboxKind::Transfer));
    if !is_transfer && out_path.exists() && !args.yes && !prompt_recompute(&out_path)? {
        info!(path = %out_path.display(), "reusing existing attack dump");
        cfg.box_kind = BoxKind::Other(OtherboxKind::Transfer);
        cfg.transfer_path = Some(out_path.clone());
        cfg.save_path = None;
    }

    // the attack differentiates the raw pipeline; only the reported
    // accuracies go through the ensemble predictor
    let outcome = if args.ensemble > 1 {
        let scorer = EnsemblePostSoftmax::new(&pipeline, args.ensemble)?;
        run_attack(&pipeline, &scorer, &ds, &cfg)?
    } else {
        run_attack(&pipeline, &pipeline, &ds, &cfg)?
    };
    if let Some(clean) = outcome.clean_accuracy {
        println!("clean accuracy:  {:.4}", clean);
    }
    println!("robust accuracy: {:.4}", outcome.robust_accuracy);
    println!("images:          {}", outcome.images_evaluated);
    Ok(())
}

/// Ask before recomputing an existing dump; plain Enter means no.
fn prompt_recompute(path: &Path) -> anyhow::Result<bool> {
    print!("{} exists. recompute? [y/(n)] ", path.display());
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_and_backend_tokens_parse() {
        assert_eq!(parse_mode("online").unwrap(), DictMode::Online);
        assert_eq!(parse_mode("batch").unwrap(), DictMode::Batch);
        assert!(parse_mode("stream").is_err());
        assert_eq!(parse_backend("gather").unwrap(), Backend::Gather);
        assert_eq!(parse_backend("unfold").unwrap(), Backend::Unfold);
        assert!(parse_backend("torch").is_err());
    }

    #[test]
    fn test_batch_rows_covers_all_rows() {
        let data = ndarray::Array2::<f32>::ones((10, 4));
        let total: usize = batch_rows(&data, 3)
            .map(|b| b.unwrap().nrows())
            .sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_outer_module_forces_a_single_eot_pass() {
        let outer = BoxKind::White(WhiteboxKind::OuterModule);
        assert_eq!(resolve_eot(outer, 8), 1);
        assert_eq!(resolve_eot(BoxKind::White(WhiteboxKind::Full), 8), 8);
        assert_eq!(resolve_eot(BoxKind::Other(OtherboxKind::Decision), 8), 8);
    }

    #[test]
    fn test_learn_dict_writes_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        cmd_learn_dict(
            "synthetic",
            dir.path(),
            dir.path(),
            8,
            1.0,
            6,
            6,
            2,
            64,
            "online",
            "gather",
            1,
            Some(8),
            7,
        )
        .unwrap();
        let geometry = PatchGeometry {
            height: 6,
            width: 6,
            channels: 3,
        };
        let path = dir
            .path()
            .join(namers::dictionary_file(DatasetKind::Synthetic, 8, &geometry, 6, 1.0));
        assert!(path.is_file());
    }

    #[test]
    fn test_cli_parses_an_attack_invocation() {
        let cli = Cli::try_parse_from([
            "aegis",
            "attack",
            "synthetic",
            "--classifier",
            "clf.npz",
            "--method",
            "CWlinf-PGD",
            "--box",
            "white-outer",
            "--eps",
            "0.05",
            "-y",
        ])
        .unwrap();
        match cli.command {
            Commands::Attack {
                method, box_token, eps, yes, ..
            } => {
                assert_eq!(method, "CWlinf-PGD");
                assert_eq!(box_token, "white-outer");
                assert!((eps - 0.05).abs() < 1e-6);
                assert!(yes);
            }
            _ => panic!("wrong subcommand"),
        }
    }
}
