//! Region proposal selection
//!
//! Turns anchor foreground scores and regression deltas into a fixed number of
//! proposal boxes per image:
//! 1. Rank anchors by foreground probability and keep the top `pre_nms_limit`
//! 2. Apply the (std-dev scaled) deltas and clip to the unit window
//! 3. Greedy NMS until `proposal_count` boxes are kept
//! 4. Zero-pad to `proposal_count`
//!
//! Ranking happens before the deltas are applied; only the ordering of scores
//! matters, so the kept set is the same either way.

pub mod nms;

pub use nms::{classwise_nms, non_max_suppression, rank_by_score};

use ndarray::{Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use pyramid_rcnn_anchors::AnchorCatalogue;
use pyramid_rcnn_common::{BoxCoords, BoxDelta, RcnnConfig, RcnnError, Result};
use tracing::debug;

/// Parameters of one proposal pass
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalSettings {
    /// Proposals returned per image (padded with zero boxes)
    pub proposal_count: usize,
    pub nms_threshold: f32,
    /// Candidates kept by score before NMS
    pub pre_nms_limit: usize,
    /// Deltas are multiplied by these before being applied
    pub bbox_std_dev: [f32; 4],
}

impl ProposalSettings {
    /// Settings for a training pass
    #[must_use]
    pub fn training(config: &RcnnConfig) -> Self {
        Self::with_count(config, config.rpn.post_nms_rois_training)
    }

    /// Settings for an inference pass
    #[must_use]
    pub fn inference(config: &RcnnConfig) -> Self {
        Self::with_count(config, config.rpn.post_nms_rois_inference)
    }

    fn with_count(config: &RcnnConfig, proposal_count: usize) -> Self {
        Self {
            proposal_count,
            nms_threshold: config.rpn.nms_threshold,
            pre_nms_limit: config.rpn.pre_nms_limit,
            bbox_std_dev: config.rpn.bbox_std_dev,
        }
    }
}

/// Select proposals for a batch
///
/// # Arguments
/// * `fg_scores` - Foreground probability, `[batch, anchors]`
/// * `deltas` - Regression deltas `(dy, dx, log(dh), log(dw))`, `[batch, anchors, 4]`
/// * `anchors` - Catalogue the score/delta arrays are aligned to
///
/// Returns `[batch, proposal_count, 4]` normalized boxes, zero-padded.
pub fn select_proposals(
    fg_scores: ArrayView2<f32>,
    deltas: ArrayView3<f32>,
    anchors: &AnchorCatalogue,
    settings: &ProposalSettings,
) -> Result<Array3<f32>> {
    let (batch, num_anchors) = fg_scores.dim();
    if num_anchors != anchors.len() {
        return Err(RcnnError::Shape(format!(
            "scores cover {num_anchors} anchors, catalogue has {}",
            anchors.len()
        )));
    }
    if deltas.dim() != (batch, num_anchors, 4) {
        return Err(RcnnError::Shape(format!(
            "deltas shape {:?}, expected ({batch}, {num_anchors}, 4)",
            deltas.dim()
        )));
    }

    let mut proposals = Array3::zeros((batch, settings.proposal_count, 4));
    for image in 0..batch {
        let kept = select_image_proposals(
            fg_scores.index_axis(Axis(0), image),
            deltas.index_axis(Axis(0), image),
            anchors.boxes(),
            settings,
        );
        debug!(
            "Image {}: {} proposals kept of {} requested",
            image,
            kept.len(),
            settings.proposal_count
        );

        let mut slots = proposals.index_axis_mut(Axis(0), image);
        for (slot, bbox) in kept.iter().enumerate() {
            bbox.write_row(slots.index_axis_mut(Axis(0), slot));
        }
    }

    Ok(proposals)
}

/// Select proposals for a single image, unpadded, highest score first
#[must_use]
pub fn select_image_proposals(
    scores: ArrayView1<f32>,
    deltas: ArrayView2<f32>,
    anchors: &[BoxCoords],
    settings: &ProposalSettings,
) -> Vec<BoxCoords> {
    let scores: Vec<f32> = scores.iter().copied().collect();
    let mut order = rank_by_score(&scores);
    order.truncate(settings.pre_nms_limit.min(anchors.len()));

    let window = BoxCoords::new(0.0, 0.0, 1.0, 1.0);
    let candidates: Vec<BoxCoords> = order
        .iter()
        .map(|&i| {
            let row = deltas.row(i);
            let delta = BoxDelta::from_array([row[0], row[1], row[2], row[3]])
                .denormalize(&settings.bbox_std_dev);
            anchors[i].apply_delta(&delta).clip(&window)
        })
        .collect();
    let candidate_scores: Vec<f32> = order.iter().map(|&i| scores[i]).collect();

    non_max_suppression(
        &candidates,
        &candidate_scores,
        settings.nms_threshold,
        settings.proposal_count,
    )
    .into_iter()
    .map(|k| candidates[k])
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};
    use pyramid_rcnn_anchors::LevelAnchorSpec;

    fn catalogue() -> AnchorCatalogue {
        let levels = vec![LevelAnchorSpec {
            scales: vec![16.0],
            ratios: vec![1.0],
            feature_shape: [4, 4],
            feature_stride: 8,
        }];
        AnchorCatalogue::generate(&levels, 1, [32, 32]).unwrap()
    }

    fn settings(count: usize) -> ProposalSettings {
        ProposalSettings {
            proposal_count: count,
            nms_threshold: 0.3,
            pre_nms_limit: 100,
            bbox_std_dev: [0.1, 0.1, 0.2, 0.2],
        }
    }

    #[test]
    fn test_output_padded_to_count() {
        let anchors = catalogue();
        let scores = Array2::from_elem((2, anchors.len()), 0.5f32);
        let deltas = Array3::zeros((2, anchors.len(), 4));
        let proposals =
            select_proposals(scores.view(), deltas.view(), &anchors, &settings(40)).unwrap();

        assert_eq!(proposals.dim(), (2, 40, 4));
        // only 16 anchors exist, the rest are zero rows
        let last = proposals.index_axis(Axis(0), 0).row(39).to_owned();
        assert!(last.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_kept_boxes_do_not_overlap() {
        let anchors = catalogue();
        let scores = Array2::from_shape_fn((1, anchors.len()), |(_, i)| i as f32 / 16.0);
        let deltas = Array3::zeros((1, anchors.len(), 4));
        let proposals =
            select_proposals(scores.view(), deltas.view(), &anchors, &settings(16)).unwrap();

        let boxes: Vec<BoxCoords> = BoxCoords::rows(proposals.index_axis(Axis(0), 0))
            .into_iter()
            .filter(|b| !b.is_empty())
            .collect();
        assert!(!boxes.is_empty());
        for (i, a) in boxes.iter().enumerate() {
            for b in &boxes[i + 1..] {
                assert!(a.iou(b) <= 0.3);
            }
        }
    }

    #[test]
    fn test_highest_score_first_and_clipped() {
        let anchors = catalogue();
        let mut scores = Array2::zeros((1, anchors.len()));
        scores[[0, 5]] = 0.99;
        let deltas = Array3::zeros((1, anchors.len(), 4));
        let proposals =
            select_proposals(scores.view(), deltas.view(), &anchors, &settings(4)).unwrap();

        let first = BoxCoords::rows(proposals.index_axis(Axis(0), 0))[0];
        let expected = anchors.boxes()[5].clip(&BoxCoords::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(first, expected);
        for v in proposals.iter() {
            assert!((0.0..=1.0).contains(v));
        }
    }

    #[test]
    fn test_deltas_scaled_by_std_dev() {
        let anchors = catalogue();
        let mut scores = Array2::zeros((1, anchors.len()));
        scores[[0, 5]] = 1.0;
        let mut deltas = Array3::zeros((1, anchors.len(), 4));
        deltas[[0, 5, 0]] = 1.0; // dy = 1.0 * 0.1 of the anchor height

        let proposals =
            select_proposals(scores.view(), deltas.view(), &anchors, &settings(1)).unwrap();
        let moved = BoxCoords::rows(proposals.index_axis(Axis(0), 0))[0];
        let anchor = anchors.boxes()[5];
        assert!((moved.y1 - (anchor.y1 + 0.1 * anchor.height())).abs() < 1e-5);
    }

    #[test]
    fn test_shape_mismatch() {
        let anchors = catalogue();
        let scores = Array2::zeros((1, 3));
        let deltas = Array3::zeros((1, 3, 4));
        assert!(matches!(
            select_proposals(scores.view(), deltas.view(), &anchors, &settings(4)),
            Err(RcnnError::Shape(_))
        ));
    }
}
