//! Image-patch extraction and sparse dictionary learning.
//!
//! The extractor slides a fixed window over every image of a batch and
//! flattens the crops for a dictionary solver. Two backends exist (a direct
//! gather and an im2col-style unfold) that must produce identical patch
//! sets; tests hold them to that.
//!
//! The learner is a mini-batch online dictionary learner in the style of
//! Mairal et al.: ISTA sparse coding per patch, accumulated sufficient
//! statistics, block-coordinate atom updates. The driver streams a dataset
//! through the extractor, feeds the learner, and persists the result as a
//! single `.npz` archive, skipping the whole computation when the archive
//! already exists.

pub mod batch;
pub mod dictionary;
pub mod driver;
pub mod extract;
pub mod learner;

pub use batch::ImageBatch;
pub use dictionary::{DictParams, Dictionary};
pub use driver::{learn_dictionary, DictLearnConfig, DictMode};
pub use extract::{extract_patches, flatten_patches, Backend};
pub use learner::MiniBatchDictLearner;
