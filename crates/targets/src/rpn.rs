//! Region-proposal-stage targets
//!
//! Every anchor is labelled against the image's ground truth:
//! - positive (`1`): `IoU` >= `positive_iou`, or the best anchor of some box
//! - negative (`-1`): `IoU` <= `negative_iou` and not positive
//! - neutral (`0`): everything else, excluded from the loss
//!
//! Positives are capped at half of `train_anchors_per_image`, negatives fill the
//! rest. Regression targets of the kept positives are compacted, in ascending
//! anchor order, into the first rows of the delta array.

use crate::ground_truth::GroundTruthBatch;
use crate::sampling::{Candidate, Sampler};
use ndarray::{aview1, Array1, Array2, Array3, Axis};
use pyramid_rcnn_anchors::AnchorCatalogue;
use pyramid_rcnn_common::{overlaps, BoxCoords, RcnnConfig, RcnnError, Result};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct RpnTargetSettings {
    pub train_anchors_per_image: usize,
    pub positive_iou: f32,
    pub negative_iou: f32,
    pub bbox_std_dev: [f32; 4],
}

impl RpnTargetSettings {
    #[must_use]
    pub fn from_config(config: &RcnnConfig) -> Self {
        Self {
            train_anchors_per_image: config.rpn.train_anchors_per_image,
            positive_iou: config.rpn.positive_iou,
            negative_iou: config.rpn.negative_iou,
            bbox_std_dev: config.rpn.bbox_std_dev,
        }
    }
}

/// Anchor labels and regression targets for a batch
#[derive(Debug, Clone, PartialEq)]
pub struct RpnTargets {
    /// `[batch, anchors]` with `1` / `-1` / `0`
    pub matches: Array2<i8>,
    /// `[batch, train_anchors_per_image, 4]`, normalized by the std-dev
    pub deltas: Array3<f32>,
}

impl RpnTargets {
    /// Kept positives per image
    #[must_use]
    pub fn positive_counts(&self) -> Vec<usize> {
        self.matches
            .outer_iter()
            .map(|row| row.iter().filter(|&&m| m == 1).count())
            .collect()
    }
}

/// Build targets for every image of a batch
///
/// `ground_truth` must hold normalized boxes.
pub fn build_rpn_targets(
    anchors: &AnchorCatalogue,
    ground_truth: &GroundTruthBatch,
    settings: &RpnTargetSettings,
    sampler: &Sampler,
) -> Result<RpnTargets> {
    if settings.train_anchors_per_image == 0 {
        return Err(RcnnError::Config(
            "train_anchors_per_image must be positive".to_string(),
        ));
    }

    let batch = ground_truth.batch_size();
    let mut matches = Array2::zeros((batch, anchors.len()));
    let mut deltas = Array3::zeros((batch, settings.train_anchors_per_image, 4));

    for image in 0..batch {
        let (image_matches, image_deltas) = image_rpn_targets(
            anchors.boxes(),
            &ground_truth.image_boxes(image),
            settings,
            sampler,
            image,
        );
        matches.index_axis_mut(Axis(0), image).assign(&image_matches);
        deltas.index_axis_mut(Axis(0), image).assign(&image_deltas);
    }

    Ok(RpnTargets { matches, deltas })
}

/// Targets for one image: `([anchors], [train_anchors_per_image, 4])`
#[must_use]
pub fn image_rpn_targets(
    anchors: &[BoxCoords],
    gt_boxes: &[BoxCoords],
    settings: &RpnTargetSettings,
    sampler: &Sampler,
    image: usize,
) -> (Array1<i8>, Array2<f32>) {
    let mut matches = Array1::zeros(anchors.len());
    let mut deltas = Array2::zeros((settings.train_anchors_per_image, 4));

    let iou = overlaps(anchors, gt_boxes);
    let (best_iou, best_gt): (Vec<f32>, Vec<usize>) = iou
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
        .unzip();

    let mut forced = vec![false; anchors.len()];
    if !anchors.is_empty() {
        for column in iou.columns() {
            let mut arg = 0;
            for (a, &v) in column.iter().enumerate() {
                if v > column[arg] {
                    arg = a;
                }
            }
            forced[arg] = true;
        }
    }

    let mut positives = Vec::new();
    let mut negatives = Vec::new();
    for a in 0..anchors.len() {
        if forced[a] || best_iou[a] >= settings.positive_iou {
            positives.push(Candidate {
                index: a,
                iou: best_iou[a],
                forced: forced[a],
            });
        } else if best_iou[a] <= settings.negative_iou {
            negatives.push(a);
        }
    }

    let positive_cap = settings.train_anchors_per_image / 2;
    let kept_positives = sampler.positives(&positives, positive_cap, image);
    let negative_cap = settings.train_anchors_per_image - kept_positives.len();
    let kept_negatives = sampler.negatives(&negatives, negative_cap, image);

    for &a in &kept_negatives {
        matches[a] = -1;
    }
    for (row, &a) in kept_positives.iter().enumerate() {
        matches[a] = 1;
        let delta = anchors[a]
            .delta_to(&gt_boxes[best_gt[a]])
            .normalize(&settings.bbox_std_dev);
        deltas.row_mut(row).assign(&aview1(&delta.to_array()));
    }

    debug!(
        "Image {}: {} positive / {} negative anchors ({} / {} candidates)",
        image,
        kept_positives.len(),
        kept_negatives.len(),
        positives.len(),
        negatives.len()
    );

    (matches, deltas)
}
