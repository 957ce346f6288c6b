//! Adversarial attacks against frozen defense pipelines: the white-box
//! gradient family, the decision-based boundary attack, and the orchestrator
//! that runs a full robust-accuracy evaluation.

pub mod boundary;
pub mod gradient;
pub mod orchestrator;
pub mod spec;
pub mod storage;

pub use boundary::BoundaryParams;
pub use orchestrator::{run_attack, AttackConfig, AttackOutcome};
pub use spec::{AttackMethod, AttackParams, BoxKind, NormKind, OtherboxKind, Routine, WhiteboxKind};
pub use storage::{load_adversarial, save_adversarial};
