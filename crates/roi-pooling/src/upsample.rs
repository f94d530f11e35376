//! Feature-map upsampling for the finest pyramid levels

use ndarray::{Array4, ArrayView4, Axis};
use pyramid_rcnn_common::{RcnnError, Result};

/// Doubles the spatial size of a `[batch, channels, height, width]` map
///
/// A learned implementation (transposed convolution) plugs in here; `level` lets
/// it keep separate weights per pyramid level.
pub trait FeatureUpsampler: Send + Sync {
    fn upsample(&self, level: usize, features: ArrayView4<f32>) -> Result<Array4<f32>>;
}

/// Parameter-free x2 bilinear upsampling with half-pixel centers
#[derive(Debug, Clone, Copy, Default)]
pub struct BilinearUpsampler;

/// `(low, high, fraction)` source taps for every output index
fn source_taps(size: usize) -> Vec<(usize, usize, f32)> {
    (0..size * 2)
        .map(|i| {
            let position = ((i as f32 + 0.5) / 2.0 - 0.5).clamp(0.0, (size - 1) as f32);
            let low = position.floor() as usize;
            let high = (low + 1).min(size - 1);
            (low, high, position - low as f32)
        })
        .collect()
}

impl FeatureUpsampler for BilinearUpsampler {
    fn upsample(&self, _level: usize, features: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (batch, channels, height, width) = features.dim();
        if height == 0 || width == 0 {
            return Err(RcnnError::Shape(format!(
                "cannot upsample an empty {height}x{width} map"
            )));
        }

        let ys = source_taps(height);
        let xs = source_taps(width);
        let mut output = Array4::zeros((batch, channels, height * 2, width * 2));

        for (source, mut target) in features
            .axis_iter(Axis(0))
            .zip(output.axis_iter_mut(Axis(0)))
        {
            for (plane, mut out) in source.axis_iter(Axis(0)).zip(target.axis_iter_mut(Axis(0))) {
                for (i, &(top, bottom, fy)) in ys.iter().enumerate() {
                    for (j, &(left, right, fx)) in xs.iter().enumerate() {
                        let upper =
                            plane[[top, left]] + (plane[[top, right]] - plane[[top, left]]) * fx;
                        let lower = plane[[bottom, left]]
                            + (plane[[bottom, right]] - plane[[bottom, left]]) * fx;
                        out[[i, j]] = upper + (lower - upper) * fy;
                    }
                }
            }
        }

        Ok(output)
    }
}
