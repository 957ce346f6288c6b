//! Image batches with an explicit channel-ordering tag.

use aegis_core::{AegisError, ChannelOrder, ImageKind, Result};
use ndarray::{Array2, Array3, Array4, ArrayD, Axis};

/// A batch of images together with the layout its axes follow.
///
/// The order tag is part of the value: every accessor honors it, and
/// conversions between layouts are explicit moves of the data.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    data: Array4<f32>,
    order: ChannelOrder,
}

impl ImageBatch {
    /// Wrap a rank-4 array whose axes already follow `order`.
    pub fn new(data: Array4<f32>, order: ChannelOrder) -> Self {
        Self { data, order }
    }

    /// Promote a single grayscale image (height, width) to a batch of one.
    pub fn from_gray_image(image: Array2<f32>) -> Self {
        let (h, w) = image.dim();
        let data = image
            .into_shape_with_order((1, h, w, 1))
            .expect("reshape of owned contiguous array cannot fail");
        Self {
            data,
            order: ChannelOrder::Nhwc,
        }
    }

    /// Promote rank-3 input to a batch.
    ///
    /// Rank-3 arrays are ambiguous: `(h, w, c)` for one color image versus
    /// `(n, h, w)` for a stack of grayscale images. The caller states which
    /// reading is intended via `kind`; nothing is inferred from dimension
    /// sizes.
    pub fn from_rank3(array: Array3<f32>, kind: ImageKind, order: ChannelOrder) -> Result<Self> {
        let (a, b, c) = array.dim();
        let data = match kind {
            ImageKind::Single => {
                let dyn_arr = array.into_dyn();
                let with_batch = dyn_arr.insert_axis(Axis(0));
                with_batch
                    .into_dimensionality::<ndarray::Ix4>()
                    .map_err(|_| AegisError::shape_mismatch(vec![1, a, b, c], vec![a, b, c]))?
            }
            ImageKind::Stack => {
                // (n, h, w) stacks are channel-less; give them a unit
                // channel axis at the position the declared order expects.
                let dyn_arr = array.into_dyn();
                let axis = match order {
                    ChannelOrder::Nhwc => Axis(3),
                    ChannelOrder::Nchw => Axis(1),
                };
                let with_channel = dyn_arr.insert_axis(axis);
                with_channel
                    .into_dimensionality::<ndarray::Ix4>()
                    .map_err(|_| AegisError::shape_mismatch(vec![a, b, c, 1], vec![a, b, c]))?
            }
        };
        Ok(Self { data, order })
    }

    /// Promote dynamically-ranked input, requiring a kind tag for rank 3.
    pub fn from_dyn(
        array: ArrayD<f32>,
        kind: Option<ImageKind>,
        order: ChannelOrder,
    ) -> Result<Self> {
        match array.ndim() {
            2 => {
                let gray = array
                    .into_dimensionality::<ndarray::Ix2>()
                    .expect("checked rank 2");
                Ok(Self::from_gray_image(gray))
            }
            3 => {
                let kind = kind.ok_or_else(|| {
                    AegisError::InvalidArgument(
                        "rank-3 image input requires an explicit image-kind tag \
                         (single color image vs stack of grayscale images)"
                            .into(),
                    )
                })?;
                let arr = array
                    .into_dimensionality::<ndarray::Ix3>()
                    .expect("checked rank 3");
                Self::from_rank3(arr, kind, order)
            }
            4 => {
                let arr = array
                    .into_dimensionality::<ndarray::Ix4>()
                    .expect("checked rank 4");
                Ok(Self::new(arr, order))
            }
            n => Err(AegisError::InvalidArgument(format!(
                "image input rank must be in [2, 4], got {n}"
            ))),
        }
    }

    pub fn order(&self) -> ChannelOrder {
        self.order
    }

    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn into_data(self) -> Array4<f32> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (height, width, channels) regardless of layout.
    pub fn image_dims(&self) -> (usize, usize, usize) {
        let s = self.data.shape();
        match self.order {
            ChannelOrder::Nhwc => (s[1], s[2], s[3]),
            ChannelOrder::Nchw => (s[2], s[3], s[1]),
        }
    }

    /// Move the batch into the requested layout. A no-op when the tag
    /// already matches; otherwise a materialized axis permutation, so the
    /// result is standard-contiguous either way.
    pub fn into_order(self, target: ChannelOrder) -> Self {
        if self.order == target {
            return self;
        }
        let permuted = match (self.order, target) {
            (ChannelOrder::Nhwc, ChannelOrder::Nchw) => self.data.permuted_axes([0, 3, 1, 2]),
            (ChannelOrder::Nchw, ChannelOrder::Nhwc) => self.data.permuted_axes([0, 2, 3, 1]),
            _ => unreachable!("orders differ"),
        };
        Self {
            data: permuted.as_standard_layout().to_owned(),
            order: target,
        }
    }

    /// Flatten each image to a feature row: (n, h*w*c) in the batch's
    /// current layout.
    pub fn flatten_images(&self) -> Array2<f32> {
        let n = self.len();
        let flat = self.data.len() / n.max(1);
        self.data
            .to_owned()
            .into_shape_with_order((n, flat))
            .expect("element count preserved")
    }
}
