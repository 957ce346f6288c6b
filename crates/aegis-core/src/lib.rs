//! Core types for the aegis adversarial-robustness bench.
//!
//! This crate provides the shared vocabulary of the workspace: the error
//! taxonomy, channel-ordering and image-kind tags, patch geometry, and the
//! valid pixel range that every attacked batch is clamped to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Memory layout of an image batch.
///
/// The tag travels with every batch and must be honored on every access;
/// ignoring it silently corrupts patch semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelOrder {
    /// Batch, height, width, channels (channel-last).
    Nhwc,
    /// Batch, channels, height, width (channel-first).
    Nchw,
}

impl fmt::Display for ChannelOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelOrder::Nhwc => write!(f, "NHWC"),
            ChannelOrder::Nchw => write!(f, "NCHW"),
        }
    }
}

impl FromStr for ChannelOrder {
    type Err = AegisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NHWC" | "nhwc" => Ok(ChannelOrder::Nhwc),
            "NCHW" | "nchw" => Ok(ChannelOrder::Nchw),
            other => Err(AegisError::InvalidArgument(format!(
                "channel order not understood (expected \"NHWC\" or \"NCHW\", got \"{other}\")"
            ))),
        }
    }
}

/// Disambiguation tag for rank-3 image input.
///
/// A rank-3 array is either one color image or a stack of single-channel
/// images; the two cannot be told apart from the trailing dimension alone,
/// so callers state which one they mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageKind {
    /// One image with a channel dimension.
    Single,
    /// A stack of single-channel images.
    Stack,
}

/// Spatial geometry of an extracted patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchGeometry {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl PatchGeometry {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Length of a flattened patch vector.
    pub fn flat_len(&self) -> usize {
        self.height * self.width * self.channels
    }
}

/// Valid pixel intensity range. Attacked batches are clamped into this
/// range before any metric computation or persistence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelRange {
    pub min: f32,
    pub max: f32,
}

impl Default for PixelRange {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

impl PixelRange {
    pub fn new(min: f32, max: f32) -> Self {
        debug_assert!(min <= max, "invalid pixel range: {min} > {max}");
        Self { min, max }
    }

    #[inline]
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }

    #[inline]
    pub fn contains(&self, value: f32) -> bool {
        self.min <= value && value <= self.max
    }
}

/// Error taxonomy for aegis operations.
///
/// Every error is fatal for the run: there is no retry logic anywhere in
/// this workspace, and partial results are never rolled back, only
/// truncated by the example-count budget.
#[derive(Debug)]
pub enum AegisError {
    /// Unknown dataset, attack method, box type, optimizer, or scheduler
    /// token. Raised at configuration resolution, before any computation.
    UnsupportedConfig(String),

    /// A malformed argument value (bad ordering token, non-positive
    /// stride, patch larger than image, missing image-kind tag).
    InvalidArgument(String),

    /// A code path was reached whose precondition an earlier branch
    /// should have ruled out. Always a programming error, never user input.
    ContractViolation(String),

    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// File read/write failure (dictionary archive, checkpoint, attack dump).
    Io(String),
}

impl AegisError {
    pub fn shape_mismatch(expected: Vec<usize>, got: Vec<usize>) -> Self {
        AegisError::ShapeMismatch { expected, got }
    }
}

impl fmt::Display for AegisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AegisError::UnsupportedConfig(s) => write!(f, "Unsupported configuration: {s}"),
            AegisError::InvalidArgument(s) => write!(f, "Invalid argument: {s}"),
            AegisError::ContractViolation(s) => write!(f, "Contract violation: {s}"),
            AegisError::ShapeMismatch { expected, got } => {
                write!(f, "Shape mismatch: expected {expected:?}, got {got:?}")
            }
            AegisError::Io(s) => write!(f, "I/O failure: {s}"),
        }
    }
}

impl std::error::Error for AegisError {}

impl From<std::io::Error> for AegisError {
    fn from(e: std::io::Error) -> Self {
        AegisError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AegisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_order_parse() {
        assert_eq!("NHWC".parse::<ChannelOrder>().unwrap(), ChannelOrder::Nhwc);
        assert_eq!("nchw".parse::<ChannelOrder>().unwrap(), ChannelOrder::Nchw);

        let err = "NWHC".parse::<ChannelOrder>().unwrap_err().to_string();
        assert!(err.contains("channel order not understood"), "{err}");
    }

    #[test]
    fn test_patch_geometry_flat_len() {
        let geom = PatchGeometry::new(6, 6, 3);
        assert_eq!(geom.flat_len(), 108);

        let gray = PatchGeometry::new(4, 4, 1);
        assert_eq!(gray.flat_len(), 16);
    }

    #[test]
    fn test_pixel_range_clamp() {
        let range = PixelRange::default();
        assert_eq!(range.clamp(-0.5), 0.0);
        assert_eq!(range.clamp(1.5), 1.0);
        assert_eq!(range.clamp(0.25), 0.25);
        assert!(range.contains(1.0));
        assert!(!range.contains(1.0001));
    }

    #[test]
    fn test_error_display() {
        let err = AegisError::UnsupportedConfig("dataset \"MNIST\"".into());
        assert!(err.to_string().contains("Unsupported configuration"));

        let err = AegisError::ContractViolation("transfer attack reached generation".into());
        assert!(err.to_string().contains("Contract violation"));

        let err = AegisError::shape_mismatch(vec![4, 3, 32, 32], vec![4, 32, 32, 3]);
        let msg = err.to_string();
        assert!(msg.contains("[4, 3, 32, 32]"));
        assert!(msg.contains("[4, 32, 32, 3]"));
    }

    #[test]
    fn test_channel_order_serde() {
        let json = serde_json::to_string(&ChannelOrder::Nhwc).unwrap();
        let back: ChannelOrder = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ChannelOrder::Nhwc);
    }
}
