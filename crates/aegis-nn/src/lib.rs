//! Dense networks and the sparse-frontend autoencoder defense.
//!
//! Everything here works on `(batch, features)` matrices of `f32`. Forward
//! passes return explicit caches so the matching backward pass never has to
//! recompute activations, and stochastic layers (dropout) draw from an
//! externally owned RNG so whole pipelines stay reproducible under a seed.

pub mod autoencoder;
pub mod checkpoint;
pub mod classifier;
pub mod combined;
pub mod ensemble;
pub mod layers;
pub mod loss;
pub mod optim;
pub mod train;

pub use autoencoder::{SparseAutoencoder, SparsifierBackward};
pub use classifier::Classifier;
pub use combined::{Combined, CombinedOuterBpda, Pipeline};
pub use ensemble::EnsemblePostSoftmax;
pub use layers::{Dense, Mode};
pub use loss::Loss;
pub use optim::{Optimizer, OptimizerSpec, Scheduler, SchedulerSpec};
pub use train::{train_autoencoder, TrainConfig, TrainReport};
