//! Bilinear crop-and-resize
//!
//! Boxes are given in the pixel coordinates of the map being cropped (edges,
//! not centers). Each output bin takes one bilinear sample at its own center,
//! so a box that covers the whole map reproduces the map when the crop size
//! equals the map size. Samples further than one pixel outside the map are zero;
//! samples inside that margin are clamped to the border.

use crate::{BoxCoords, RcnnError, Result};
use ndarray::{Array2, Array4, ArrayView2, ArrayView4, ArrayViewMut2, Axis};

/// Interpolation taps along one axis: `(low, high, fraction)`
type Taps = Option<(usize, usize, f32)>;

fn taps(position: f32, size: usize) -> Taps {
    if size == 0 || position < -1.0 || position > size as f32 {
        return None;
    }
    let position = position.max(0.0);
    let low = position.floor() as usize;
    if low + 1 >= size {
        return Some((size - 1, size - 1, 0.0));
    }
    Some((low, low + 1, position - low as f32))
}

/// Sample positions of `bins` equal bins spanning `[start, end]`
fn axis_taps(start: f32, end: f32, bins: usize, size: usize) -> Vec<Taps> {
    let step = (end - start) / bins as f32;
    (0..bins)
        .map(|i| taps(start + (i as f32 + 0.5) * step - 0.5, size))
        .collect()
}

fn sample_plane(plane: ArrayView2<f32>, ys: &[Taps], xs: &[Taps], mut out: ArrayViewMut2<f32>) {
    for (i, y) in ys.iter().enumerate() {
        let Some((top, bottom, fy)) = *y else {
            continue;
        };
        for (j, x) in xs.iter().enumerate() {
            let Some((left, right, fx)) = *x else {
                continue;
            };
            let upper = plane[[top, left]] + (plane[[top, right]] - plane[[top, left]]) * fx;
            let lower =
                plane[[bottom, left]] + (plane[[bottom, right]] - plane[[bottom, left]]) * fx;
            out[[i, j]] = upper + (lower - upper) * fy;
        }
    }
}

/// Crop every box out of `features` (`[batch, channels, height, width]`)
///
/// `box_indices[k]` selects the batch entry that `boxes[k]` is cropped from.
/// Returns `[boxes.len(), channels, crop_size[0], crop_size[1]]`.
pub fn crop_and_resize(
    features: ArrayView4<f32>,
    boxes: &[BoxCoords],
    box_indices: &[usize],
    crop_size: [usize; 2],
) -> Result<Array4<f32>> {
    let (batch, channels, height, width) = features.dim();
    if boxes.len() != box_indices.len() {
        return Err(RcnnError::Shape(format!(
            "{} boxes but {} box indices",
            boxes.len(),
            box_indices.len()
        )));
    }
    if crop_size[0] == 0 || crop_size[1] == 0 {
        return Err(RcnnError::Config(format!(
            "crop size must be positive, got {crop_size:?}"
        )));
    }
    if let Some(&bad) = box_indices.iter().find(|&&b| b >= batch) {
        return Err(RcnnError::Shape(format!(
            "box index {bad} out of range for batch of {batch}"
        )));
    }

    let mut output = Array4::zeros((boxes.len(), channels, crop_size[0], crop_size[1]));
    for (k, (bbox, &image)) in boxes.iter().zip(box_indices).enumerate() {
        let ys = axis_taps(bbox.y1, bbox.y2, crop_size[0], height);
        let xs = axis_taps(bbox.x1, bbox.x2, crop_size[1], width);
        let source = features.index_axis(Axis(0), image);
        let mut target = output.index_axis_mut(Axis(0), k);
        for c in 0..channels {
            sample_plane(
                source.index_axis(Axis(0), c),
                &ys,
                &xs,
                target.index_axis_mut(Axis(0), c),
            );
        }
    }

    Ok(output)
}

/// Crop a single plane, e.g. an instance mask, to `crop_size`
pub fn crop_plane(plane: ArrayView2<f32>, bbox: &BoxCoords, crop_size: [usize; 2]) -> Array2<f32> {
    let (height, width) = plane.dim();
    let ys = axis_taps(bbox.y1, bbox.y2, crop_size[0], height);
    let xs = axis_taps(bbox.x1, bbox.x2, crop_size[1], width);
    let mut output = Array2::zeros((crop_size[0], crop_size[1]));
    sample_plane(plane, &ys, &xs, output.view_mut());
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_constant_map_crops_to_constant() {
        let features = Array4::from_elem((1, 2, 8, 8), 0.75f32);
        let boxes = [BoxCoords::new(1.0, 2.0, 5.5, 7.0)];
        let crops = crop_and_resize(features.view(), &boxes, &[0], [3, 3]).unwrap();

        assert_eq!(crops.dim(), (1, 2, 3, 3));
        assert!(crops.iter().all(|&v| (v - 0.75).abs() < 1e-6));
    }

    #[test]
    fn test_full_box_reproduces_map() {
        let features = Array4::from_shape_fn((1, 1, 4, 4), |(_, _, y, x)| (y * 4 + x) as f32);
        let boxes = [BoxCoords::new(0.0, 0.0, 4.0, 4.0)];
        let crops = crop_and_resize(features.view(), &boxes, &[0], [4, 4]).unwrap();

        for y in 0..4 {
            for x in 0..4 {
                assert!((crops[[0, 0, y, x]] - features[[0, 0, y, x]]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_box_index_selects_batch_entry() {
        let features = Array4::from_shape_fn((2, 1, 4, 4), |(b, _, _, _)| b as f32 + 1.0);
        let bbox = BoxCoords::new(0.0, 0.0, 4.0, 4.0);
        let crops = crop_and_resize(features.view(), &[bbox, bbox], &[1, 0], [2, 2]).unwrap();

        assert!((crops[[0, 0, 0, 0]] - 2.0).abs() < 1e-6);
        assert!((crops[[1, 0, 1, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_far_outside_is_zero() {
        let features = Array4::from_elem((1, 1, 4, 4), 1.0f32);
        let boxes = [BoxCoords::new(10.0, 10.0, 12.0, 12.0)];
        let crops = crop_and_resize(features.view(), &boxes, &[0], [2, 2]).unwrap();
        assert!(crops.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_rejects_bad_indices() {
        let features = Array4::<f32>::zeros((1, 1, 4, 4));
        let boxes = [BoxCoords::new(0.0, 0.0, 1.0, 1.0)];
        assert!(crop_and_resize(features.view(), &boxes, &[1], [2, 2]).is_err());
        assert!(crop_and_resize(features.view(), &boxes, &[], [2, 2]).is_err());
    }

    #[test]
    fn test_crop_plane_selects_region() {
        let mut mask = Array2::<f32>::zeros((8, 8));
        for y in 0..4 {
            for x in 0..4 {
                mask[[y, x]] = 1.0;
            }
        }
        let inside = crop_plane(mask.view(), &BoxCoords::new(0.0, 0.0, 4.0, 4.0), [2, 2]);
        assert!(inside.iter().all(|&v| (v - 1.0).abs() < 1e-6));

        let outside = crop_plane(mask.view(), &BoxCoords::new(4.0, 4.0, 8.0, 8.0), [2, 2]);
        assert!(outside.iter().all(|&v| v.abs() < 1e-6));
    }
}
