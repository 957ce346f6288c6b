//! Sliding-window patch extraction.
//!
//! Two code paths produce the patch set: a direct gather over window
//! positions and an im2col-style unfold followed by axis permutations.
//! They must agree exactly; the unfold path exists because it is the shape
//! of computation a tensor library performs, and keeping both honest
//! against each other catches layout bugs early.

use aegis_core::{AegisError, ChannelOrder, PatchGeometry, Result};
use ndarray::{s, Array2, Array3, Array4};

use crate::batch::ImageBatch;

/// Which extraction code path to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Direct sliding-window copy loops.
    Gather,
    /// Column unfolding (im2col) then permutation and reshape.
    Unfold,
}

fn validate(batch: &ImageBatch, geometry: PatchGeometry, stride: usize) -> Result<(usize, usize)> {
    if stride == 0 {
        return Err(AegisError::InvalidArgument("stride must be positive".into()));
    }
    if geometry.height == 0 || geometry.width == 0 || geometry.channels == 0 {
        return Err(AegisError::InvalidArgument(format!(
            "patch geometry must be positive, got {}x{}x{}",
            geometry.height, geometry.width, geometry.channels
        )));
    }
    let (h, w, c) = batch.image_dims();
    if geometry.channels != c {
        return Err(AegisError::InvalidArgument(format!(
            "patch channels ({}) must match image channels ({c})",
            geometry.channels
        )));
    }
    if geometry.height > h || geometry.width > w {
        return Err(AegisError::InvalidArgument(format!(
            "patch {}x{} does not fit into image {h}x{w}",
            geometry.height, geometry.width
        )));
    }
    let out_h = (h - geometry.height) / stride + 1;
    let out_w = (w - geometry.width) / stride + 1;
    Ok((out_h, out_w))
}

/// Extract every patch obtained by sliding `geometry` across each image
/// with `stride`, in the declared output ordering.
///
/// Output shape is `(n_patches, ph, pw, c)` for NHWC and
/// `(n_patches, c, ph, pw)` for NCHW. Patches are ordered image-major,
/// then row-major over window positions. Pure function of its inputs.
pub fn extract_patches(
    batch: &ImageBatch,
    geometry: PatchGeometry,
    stride: usize,
    out_order: ChannelOrder,
    backend: Backend,
) -> Result<Array4<f32>> {
    let (out_h, out_w) = validate(batch, geometry, stride)?;
    match backend {
        Backend::Gather => gather_patches(batch, geometry, stride, out_order, out_h, out_w),
        Backend::Unfold => unfold_patches(batch, geometry, stride, out_order, out_h, out_w),
    }
}

fn gather_patches(
    batch: &ImageBatch,
    geometry: PatchGeometry,
    stride: usize,
    out_order: ChannelOrder,
    out_h: usize,
    out_w: usize,
) -> Result<Array4<f32>> {
    // The gather loops index channel-last; normalize the input once.
    let nhwc = batch.clone().into_order(ChannelOrder::Nhwc);
    let images = nhwc.data();
    let n = nhwc.len();
    let (ph, pw, c) = (geometry.height, geometry.width, geometry.channels);

    let n_patches = n * out_h * out_w;
    let mut patches = Array4::<f32>::zeros((n_patches, ph, pw, c));

    let mut idx = 0;
    for img in 0..n {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let y0 = oy * stride;
                let x0 = ox * stride;
                let window = images.slice(s![img, y0..y0 + ph, x0..x0 + pw, ..]);
                patches.slice_mut(s![idx, .., .., ..]).assign(&window);
                idx += 1;
            }
        }
    }

    Ok(match out_order {
        ChannelOrder::Nhwc => patches,
        ChannelOrder::Nchw => patches
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .to_owned(),
    })
}

fn unfold_patches(
    batch: &ImageBatch,
    geometry: PatchGeometry,
    stride: usize,
    out_order: ChannelOrder,
    out_h: usize,
    out_w: usize,
) -> Result<Array4<f32>> {
    // The unfold path works channel-first, as a tensor library would.
    let nchw = batch.clone().into_order(ChannelOrder::Nchw);
    let images = nchw.data();
    let n = nchw.len();
    let (ph, pw, c) = (geometry.height, geometry.width, geometry.channels);
    let positions = out_h * out_w;

    // Columns: (n, c * ph * pw, positions); row index is channel-major,
    // then kernel row, then kernel column.
    let mut columns = Array3::<f32>::zeros((n, c * ph * pw, positions));
    for ch in 0..c {
        for ky in 0..ph {
            for kx in 0..pw {
                let row = ch * ph * pw + ky * pw + kx;
                for oy in 0..out_h {
                    for ox in 0..out_w {
                        let col = oy * out_w + ox;
                        for img in 0..n {
                            columns[[img, row, col]] =
                                images[[img, ch, oy * stride + ky, ox * stride + kx]];
                        }
                    }
                }
            }
        }
    }

    // (n, rows, positions) -> (n, positions, rows) -> (n * positions, c, ph, pw)
    let permuted = columns
        .permuted_axes([0, 2, 1])
        .as_standard_layout()
        .to_owned();
    let patches = permuted
        .into_shape_with_order((n * positions, c, ph, pw))
        .map_err(|_| {
            AegisError::shape_mismatch(vec![n * positions, c, ph, pw], vec![n, positions, c * ph * pw])
        })?;

    Ok(match out_order {
        ChannelOrder::Nhwc => patches
            .permuted_axes([0, 2, 3, 1])
            .as_standard_layout()
            .to_owned(),
        ChannelOrder::Nchw => patches,
    })
}

/// Flatten a patch tensor to `(n_patches, flat_len)` rows for the solver.
pub fn flatten_patches(patches: &Array4<f32>) -> Array2<f32> {
    let n = patches.shape()[0];
    let flat = patches.len() / n.max(1);
    patches
        .to_owned()
        .into_shape_with_order((n, flat))
        .expect("element count preserved")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn color_batch(n: usize, h: usize, w: usize, c: usize) -> ImageBatch {
        let data = Array::from_iter((0..n * h * w * c).map(|i| (i as f32).sin()))
            .into_shape_with_order((n, h, w, c))
            .unwrap();
        ImageBatch::new(data, ChannelOrder::Nhwc)
    }

    #[test]
    fn test_backends_agree_nhwc_and_nchw() {
        let batch = color_batch(2, 10, 8, 3);
        let geom = PatchGeometry::new(4, 3, 3);
        for out_order in [ChannelOrder::Nhwc, ChannelOrder::Nchw] {
            let a = extract_patches(&batch, geom, 2, out_order, Backend::Gather).unwrap();
            let b = extract_patches(&batch, geom, 2, out_order, Backend::Unfold).unwrap();
            assert_eq!(a, b, "backends disagree for {out_order}");
        }
    }

    #[test]
    fn test_backends_agree_from_nchw_input() {
        let batch = color_batch(3, 9, 9, 3).into_order(ChannelOrder::Nchw);
        let geom = PatchGeometry::new(3, 3, 3);
        let a = extract_patches(&batch, geom, 3, ChannelOrder::Nhwc, Backend::Gather).unwrap();
        let b = extract_patches(&batch, geom, 3, ChannelOrder::Nhwc, Backend::Unfold).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_layout_round_trip_matches_direct() {
        // Converting to channel-first and extracting channel-last must equal
        // direct channel-last extraction of the same semantic images.
        let batch = color_batch(2, 12, 12, 3);
        let geom = PatchGeometry::new(6, 6, 3);

        let direct = extract_patches(&batch, geom, 3, ChannelOrder::Nhwc, Backend::Gather).unwrap();
        let converted = batch.into_order(ChannelOrder::Nchw);
        let via_nchw =
            extract_patches(&converted, geom, 3, ChannelOrder::Nhwc, Backend::Gather).unwrap();
        assert_eq!(direct, via_nchw);
    }

    #[test]
    fn test_single_12x12x3_image_yields_9_patches() {
        let batch = color_batch(1, 12, 12, 3);
        let geom = PatchGeometry::new(6, 6, 3);
        for backend in [Backend::Gather, Backend::Unfold] {
            let patches = extract_patches(&batch, geom, 3, ChannelOrder::Nhwc, backend).unwrap();
            assert_eq!(patches.shape(), &[9, 6, 6, 3]);
        }
    }

    #[test]
    fn test_patch_values_match_source_window() {
        let batch = color_batch(1, 6, 6, 1);
        let geom = PatchGeometry::new(2, 2, 1);
        let patches =
            extract_patches(&batch, geom, 2, ChannelOrder::Nhwc, Backend::Gather).unwrap();
        // Second patch of the first row starts at column 2.
        assert_eq!(patches[[1, 0, 0, 0]], batch.data()[[0, 0, 2, 0]]);
        assert_eq!(patches[[1, 1, 1, 0]], batch.data()[[0, 1, 3, 0]]);
    }

    #[test]
    fn test_zero_stride_rejected() {
        let batch = color_batch(1, 4, 4, 1);
        let geom = PatchGeometry::new(2, 2, 1);
        let err = extract_patches(&batch, geom, 0, ChannelOrder::Nhwc, Backend::Gather)
            .unwrap_err()
            .to_string();
        assert!(err.contains("stride"), "{err}");
    }

    #[test]
    fn test_oversized_patch_rejected() {
        let batch = color_batch(1, 4, 4, 1);
        let geom = PatchGeometry::new(5, 2, 1);
        let err = extract_patches(&batch, geom, 1, ChannelOrder::Nhwc, Backend::Unfold)
            .unwrap_err()
            .to_string();
        assert!(err.contains("does not fit"), "{err}");
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let batch = color_batch(1, 4, 4, 3);
        let geom = PatchGeometry::new(2, 2, 1);
        assert!(extract_patches(&batch, geom, 1, ChannelOrder::Nhwc, Backend::Gather).is_err());
    }

    #[test]
    fn test_flatten_patches_shape() {
        let batch = color_batch(1, 12, 12, 3);
        let geom = PatchGeometry::new(6, 6, 3);
        let patches =
            extract_patches(&batch, geom, 3, ChannelOrder::Nhwc, Backend::Gather).unwrap();
        let flat = flatten_patches(&patches);
        assert_eq!(flat.shape(), &[9, 108]);
        assert_eq!(flat[[0, 0]], patches[[0, 0, 0, 0]]);
        assert_eq!(flat[[8, 107]], patches[[8, 5, 5, 2]]);
    }
}
