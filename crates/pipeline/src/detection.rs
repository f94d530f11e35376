//! Final detections from classifier output

use ndarray::{ArrayView2, ArrayView3, Axis};
use pyramid_rcnn_common::{BoxCoords, BoxDelta, RcnnConfig, RcnnError, Result};
use pyramid_rcnn_proposals::classwise_nms;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One detected object
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Box in image pixel coordinates
    pub bbox: BoxCoords,
    pub class_id: u32,
    pub score: f32,
}

/// Turn refined ROIs of one image into detections
///
/// For every ROI the highest-probability class is kept when it is foreground and
/// scores at least `detection.min_confidence`. Its class deltas (scaled by the
/// head std-dev) are applied, the box is moved to pixels, clipped to `window`
/// and rounded. Per-class NMS runs last; the result is sorted by score and
/// capped at `detection.max_instances`.
///
/// # Arguments
/// * `rois` - `[n, 4]` normalized, zero rows are padding
/// * `probs` - `[n, classes]`
/// * `deltas` - `[n, classes, 4]`
/// * `window` - Image area holding real pixels, in pixels
pub fn refine_detections(
    rois: ArrayView2<f32>,
    probs: ArrayView2<f32>,
    deltas: ArrayView3<f32>,
    window: &BoxCoords,
    config: &RcnnConfig,
) -> Result<Vec<Detection>> {
    let rows = rois.nrows();
    let classes = probs.ncols();
    if probs.nrows() != rows || deltas.dim() != (rows, classes, 4) {
        return Err(RcnnError::Shape(format!(
            "{rows} ROIs with probabilities {:?} and deltas {:?}",
            probs.dim(),
            deltas.dim()
        )));
    }

    if !window.is_ordered() {
        return Err(RcnnError::Shape(format!(
            "window {:?} is not an ordered finite box",
            window.to_array()
        )));
    }

    let [height, width] = config.data.image_shape;
    let std_dev = config.heads.bbox_std_dev;
    let mut candidates: Vec<Detection> = Vec::new();

    for (i, roi) in BoxCoords::rows(rois).into_iter().enumerate() {
        if roi.is_empty() {
            continue;
        }
        let row = probs.index_axis(Axis(0), i);
        let Some((class, &score)) = row
            .iter()
            .enumerate()
            .reduce(|best, next| if next.1 > best.1 { next } else { best })
        else {
            continue;
        };
        if class == 0 || score < config.detection.min_confidence {
            continue;
        }

        let d = deltas.slice(ndarray::s![i, class, ..]);
        let delta = BoxDelta::from_array([d[0], d[1], d[2], d[3]]).denormalize(&std_dev);
        let bbox = roi
            .apply_delta(&delta)
            .scale(height as f32, width as f32)
            .clip(window)
            .round();

        candidates.push(Detection {
            bbox,
            class_id: class as u32,
            score,
        });
    }

    let boxes: Vec<BoxCoords> = candidates.iter().map(|d| d.bbox).collect();
    let scores: Vec<f32> = candidates.iter().map(|d| d.score).collect();
    let class_ids: Vec<u32> = candidates.iter().map(|d| d.class_id).collect();
    let keep = classwise_nms(&boxes, &scores, &class_ids, config.detection.nms_threshold);

    let detections: Vec<Detection> = keep
        .into_iter()
        .take(config.detection.max_instances)
        .map(|k| candidates[k])
        .collect();
    debug!(
        "{} detections kept of {} confident ROIs",
        detections.len(),
        candidates.len()
    );
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2, Array3};

    fn config() -> RcnnConfig {
        let mut config = RcnnConfig::default();
        config.num_classes = 3;
        config.data.image_shape = [64, 64];
        config.detection.max_instances = 2;
        config
    }

    fn window() -> BoxCoords {
        BoxCoords::new(0.0, 0.0, 64.0, 64.0)
    }

    #[test]
    fn test_background_and_low_scores_dropped() {
        let rois = array![[0.0, 0.0, 0.5, 0.5], [0.5, 0.5, 1.0, 1.0], [0.1, 0.1, 0.2, 0.2]];
        let probs = array![[0.9, 0.05, 0.05], [0.2, 0.5, 0.3], [0.0, 0.1, 0.9]];
        let deltas = Array3::zeros((3, 3, 4));
        let detections =
            refine_detections(rois.view(), probs.view(), deltas.view(), &window(), &config())
                .unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_id, 2);
        assert_eq!(detections[0].bbox, BoxCoords::new(6.0, 6.0, 13.0, 13.0));
    }

    #[test]
    fn test_sorted_capped_and_clipped() {
        let rois = array![
            [0.0, 0.0, 0.25, 0.25],
            [0.5, 0.5, 1.2, 1.2],
            [0.0, 0.5, 0.25, 0.75],
            [0.0, 0.0, 0.0, 0.0]
        ];
        let probs = array![
            [0.0, 0.8, 0.2],
            [0.0, 0.95, 0.05],
            [0.0, 0.1, 0.9],
            [0.0, 1.0, 0.0]
        ];
        let deltas = Array3::zeros((4, 3, 4));
        let detections =
            refine_detections(rois.view(), probs.view(), deltas.view(), &window(), &config())
                .unwrap();

        assert_eq!(detections.len(), 2);
        assert!(detections[0].score >= detections[1].score);
        assert_eq!(detections[0].bbox, BoxCoords::new(32.0, 32.0, 64.0, 64.0));
    }

    #[test]
    fn test_class_deltas_applied() {
        let rois = array![[0.25, 0.25, 0.5, 0.5]];
        let probs = array![[0.0, 1.0, 0.0]];
        let mut deltas = Array3::zeros((1, 3, 4));
        // 10 std-dev units of dy move the box down one ROI height
        deltas[[0, 1, 0]] = 10.0;
        let detections =
            refine_detections(rois.view(), probs.view(), deltas.view(), &window(), &config())
                .unwrap();
        assert_eq!(detections[0].bbox, BoxCoords::new(32.0, 16.0, 48.0, 32.0));
    }

    #[test]
    fn test_inverted_window_rejected() {
        let rois = array![[0.1, 0.1, 0.2, 0.2]];
        let probs = array![[0.0, 1.0, 0.0]];
        let deltas = Array3::zeros((1, 3, 4));
        let inverted = BoxCoords::new(64.0, 64.0, 0.0, 0.0);
        let result =
            refine_detections(rois.view(), probs.view(), deltas.view(), &inverted, &config());
        assert!(matches!(result, Err(RcnnError::Shape(_))));
    }

    #[test]
    fn test_shape_mismatch() {
        let rois = Array2::zeros((2, 4));
        let probs = Array2::zeros((3, 3));
        let deltas = Array3::zeros((2, 3, 4));
        assert!(
            refine_detections(rois.view(), probs.view(), deltas.view(), &window(), &config())
                .is_err()
        );
    }
}
