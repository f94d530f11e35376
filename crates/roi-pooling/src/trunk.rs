//! Descriptor extraction for the consistency tracker

use ndarray::{Array2, ArrayView4, Axis};
use pyramid_rcnn_common::{RcnnError, Result};

/// Maps `[n, channels, h, w]` crops to `[n, dim]` descriptors
pub trait DescriptorTrunk: Send + Sync {
    fn extract(&self, crops: ArrayView4<f32>) -> Result<Array2<f32>>;
}

/// Spatial mean per channel, `dim == channels`
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanPoolTrunk;

impl DescriptorTrunk for MeanPoolTrunk {
    fn extract(&self, crops: ArrayView4<f32>) -> Result<Array2<f32>> {
        let (_, _, height, width) = crops.dim();
        if height == 0 || width == 0 {
            return Err(RcnnError::Shape(format!(
                "cannot pool an empty {height}x{width} crop"
            )));
        }
        let sums = crops.sum_axis(Axis(3)).sum_axis(Axis(2));
        Ok(sums / (height * width) as f32)
    }
}
