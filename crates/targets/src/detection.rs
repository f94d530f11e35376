//! Detection-stage targets
//!
//! Samples a fixed number of ROIs per image out of the proposals and pairs each
//! with a class, a box regression target and a mask target. Positives come
//! first, then background ROIs, then zero padding.

use crate::ground_truth::GroundTruthBatch;
use crate::sampling::{Candidate, Sampler};
use ndarray::{aview1, s, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};
use pyramid_rcnn_common::crop::crop_plane;
use pyramid_rcnn_common::{overlaps, BoxCoords, RcnnConfig, RcnnError, Result};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionTargetSettings {
    /// ROIs sampled per image (`R`)
    pub rois_per_image: usize,
    pub positive_ratio: f32,
    pub positive_iou: f32,
    pub mask_shape: [usize; 2],
    pub bbox_std_dev: [f32; 4],
}

impl DetectionTargetSettings {
    #[must_use]
    pub fn from_config(config: &RcnnConfig) -> Self {
        Self {
            rois_per_image: config.rois.train_rois_per_image,
            positive_ratio: config.rois.positive_ratio,
            positive_iou: config.rois.positive_iou,
            mask_shape: config.heads.mask_shape,
            bbox_std_dev: config.heads.bbox_std_dev,
        }
    }

    /// Upper bound on positives per image
    #[must_use]
    pub fn positive_cap(&self) -> usize {
        (self.rois_per_image as f32 * self.positive_ratio).floor() as usize
    }
}

/// Sampled ROIs and their targets, every array padded to `R` ROIs per image
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionTargets {
    /// `[batch, R, 4]` normalized
    pub rois: Array3<f32>,
    /// `[batch, R]`, 0 for background and padding
    pub class_ids: Array2<u32>,
    /// `[batch, R, 4]`, zero for background
    pub deltas: Array3<f32>,
    /// `[batch, R, mask_height, mask_width]`, zero for background
    pub masks: Array4<f32>,
    /// Sampled (positive + negative) ROIs per image
    pub roi_counts: Vec<usize>,
    pub positive_counts: Vec<usize>,
}

impl DetectionTargets {
    /// True when no image sampled any ROI
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roi_counts.iter().all(|&c| c == 0)
    }
}

/// Sample ROIs for every image
///
/// # Arguments
/// * `proposals` - `[batch, P, 4]` normalized, zero rows are padding
/// * `ground_truth` - Normalized boxes with full-resolution masks
pub fn build_detection_targets(
    proposals: ArrayView3<f32>,
    ground_truth: &GroundTruthBatch,
    settings: &DetectionTargetSettings,
    sampler: &Sampler,
) -> Result<DetectionTargets> {
    let batch = proposals.len_of(Axis(0));
    if batch != ground_truth.batch_size() {
        return Err(RcnnError::Shape(format!(
            "{batch} proposal sets for {} ground-truth images",
            ground_truth.batch_size()
        )));
    }
    if proposals.len_of(Axis(2)) != 4 {
        return Err(RcnnError::Shape(format!(
            "proposals shape {:?}, expected [batch, n, 4]",
            proposals.dim()
        )));
    }

    let rois_per_image = settings.rois_per_image;
    let [mask_h, mask_w] = settings.mask_shape;
    let mut targets = DetectionTargets {
        rois: Array3::zeros((batch, rois_per_image, 4)),
        class_ids: Array2::zeros((batch, rois_per_image)),
        deltas: Array3::zeros((batch, rois_per_image, 4)),
        masks: Array4::zeros((batch, rois_per_image, mask_h, mask_w)),
        roi_counts: vec![0; batch],
        positive_counts: vec![0; batch],
    };

    for image in 0..batch {
        let candidates: Vec<BoxCoords> =
            BoxCoords::rows(proposals.index_axis(Axis(0), image))
                .into_iter()
                .filter(|b| !b.is_empty())
                .collect();
        let gt_boxes = ground_truth.image_boxes(image);
        let gt_class_ids = ground_truth.image_class_ids(image);
        let gt_masks = ground_truth.image_masks(image);

        let iou = overlaps(&candidates, &gt_boxes);
        let best: Vec<(f32, usize)> = iou
            .outer_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0.0f32, 0usize), |(best, arg), (g, &v)| {
                        if v > best {
                            (v, g)
                        } else {
                            (best, arg)
                        }
                    })
            })
            .collect();

        let mut positives = Vec::new();
        let mut negatives = Vec::new();
        for (index, &(max_iou, _)) in best.iter().enumerate() {
            if !gt_boxes.is_empty() && max_iou >= settings.positive_iou {
                positives.push(Candidate {
                    index,
                    iou: max_iou,
                    forced: false,
                });
            } else {
                negatives.push(index);
            }
        }

        let kept_positives = sampler.positives(&positives, settings.positive_cap(), image);
        let negative_cap = rois_per_image - kept_positives.len();
        let kept_negatives = sampler.negatives(&negatives, negative_cap, image);

        for (slot, &index) in kept_positives.iter().enumerate() {
            let roi = candidates[index];
            let gt = best[index].1;
            roi.write_row(targets.rois.slice_mut(s![image, slot, ..]));
            targets.class_ids[[image, slot]] = gt_class_ids[gt];

            let delta = roi
                .delta_to(&gt_boxes[gt])
                .normalize(&settings.bbox_std_dev);
            targets
                .deltas
                .slice_mut(s![image, slot, ..])
                .assign(&aview1(&delta.to_array()));

            targets
                .masks
                .slice_mut(s![image, slot, .., ..])
                .assign(&mask_target(
                    gt_masks.index_axis(Axis(0), gt),
                    &roi,
                    settings.mask_shape,
                ));
        }
        for (offset, &index) in kept_negatives.iter().enumerate() {
            let slot = kept_positives.len() + offset;
            candidates[index].write_row(targets.rois.slice_mut(s![image, slot, ..]));
        }

        targets.positive_counts[image] = kept_positives.len();
        targets.roi_counts[image] = kept_positives.len() + kept_negatives.len();
        debug!(
            "Image {}: sampled {} ROIs ({} positive) from {} proposals",
            image,
            targets.roi_counts[image],
            kept_positives.len(),
            candidates.len()
        );
    }

    Ok(targets)
}

/// Crop a full-resolution instance mask with a normalized ROI and binarize it
#[must_use]
pub fn mask_target(mask: ArrayView2<f32>, roi: &BoxCoords, mask_shape: [usize; 2]) -> Array2<f32> {
    let (height, width) = mask.dim();
    let pixel_roi = roi.scale(height as f32, width as f32);
    crop_plane(mask, &pixel_roi, mask_shape).mapv(f32::round_ties_even)
}
