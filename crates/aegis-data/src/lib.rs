//! Dataset loading and batching. Images come out as `(n, c, h, w)` floats
//! in `[0, 1]` regardless of source; consumers flatten or re-wrap as they
//! need.

pub mod cifar;
pub mod dataset;
pub mod synthetic;

pub use cifar::{load_cifar10, Cifar10Split};
pub use dataset::{Dataset, DatasetKind};
pub use synthetic::synthetic_dataset;
