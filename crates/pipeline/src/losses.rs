//! Multi-task training losses
//!
//! Every loss is a mean over its contributing elements and is `0.0` when no
//! element contributes (no non-neutral anchor, no positive ROI, ...).

use ndarray::{s, Array1, ArrayView1, ArrayView2, ArrayView3, ArrayView4, ArrayView5, Axis};
use pyramid_rcnn_common::{RcnnError, Result};
use serde::{Deserialize, Serialize};

/// Probability clamp of the mask cross-entropy
const MASK_EPS: f32 = 1e-7;

/// The five detector losses of a training pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossVector {
    pub rpn_class: f32,
    pub rpn_bbox: f32,
    pub mrcnn_class: f32,
    pub mrcnn_bbox: f32,
    pub mrcnn_mask: f32,
}

impl LossVector {
    /// `[rpn_class, rpn_bbox, mrcnn_class, mrcnn_bbox, mrcnn_mask]`
    #[must_use]
    pub fn as_array(&self) -> [f32; 5] {
        [
            self.rpn_class,
            self.rpn_bbox,
            self.mrcnn_class,
            self.mrcnn_bbox,
            self.mrcnn_mask,
        ]
    }

    #[must_use]
    pub fn total(&self) -> f32 {
        self.as_array().iter().sum()
    }
}

fn mean(sum: f32, count: usize) -> f32 {
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

/// Negative log-softmax of `logits[target]`
fn cross_entropy(logits: ArrayView1<f32>, target: usize) -> f32 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = logits.iter().map(|&l| (l - max).exp()).sum::<f32>().ln() + max;
    log_sum - logits[target]
}

#[inline]
fn smooth_l1(diff: f32) -> f32 {
    let diff = diff.abs();
    if diff < 1.0 {
        0.5 * diff * diff
    } else {
        diff - 0.5
    }
}

fn check(name: &str, actual: &[usize], expected: &[usize]) -> Result<()> {
    if actual != expected {
        return Err(RcnnError::Shape(format!(
            "{name} has shape {actual:?}, expected {expected:?}"
        )));
    }
    Ok(())
}

/// Anchor classification: cross-entropy over positive and negative anchors
///
/// * `matches` - `[batch, anchors]` with `1` / `-1` / `0`
/// * `logits` - `[batch, anchors, 2]`
pub fn rpn_class_loss(matches: ArrayView2<i8>, logits: ArrayView3<f32>) -> Result<f32> {
    let (batch, anchors) = matches.dim();
    check("RPN logits", logits.shape(), &[batch, anchors, 2])?;

    let mut sum = 0.0;
    let mut count = 0;
    for ((image, anchor), &m) in matches.indexed_iter() {
        if m == 0 {
            continue;
        }
        let target = usize::from(m == 1);
        sum += cross_entropy(logits.slice(s![image, anchor, ..]), target);
        count += 1;
    }
    Ok(mean(sum, count))
}

/// Anchor regression: smooth-L1 on positive anchors
///
/// * `target_deltas` - `[batch, train_anchors, 4]`, positives compacted in anchor order
/// * `matches` - `[batch, anchors]`
/// * `pred_deltas` - `[batch, anchors, 4]`
pub fn rpn_bbox_loss(
    target_deltas: ArrayView3<f32>,
    matches: ArrayView2<i8>,
    pred_deltas: ArrayView3<f32>,
) -> Result<f32> {
    let (batch, anchors) = matches.dim();
    check("RPN deltas", pred_deltas.shape(), &[batch, anchors, 4])?;
    let capacity = target_deltas.len_of(Axis(1));
    check(
        "RPN delta targets",
        target_deltas.shape(),
        &[batch, capacity, 4],
    )?;

    let mut sum = 0.0;
    let mut count = 0;
    for image in 0..batch {
        let image_matches = matches.row(image);
        let positives = image_matches
            .iter()
            .enumerate()
            .filter(|&(_, &m)| m == 1)
            .map(|(a, _)| a)
            .take(capacity);
        for (row, anchor) in positives.enumerate() {
            let target = target_deltas.slice(s![image, row, ..]);
            let pred = pred_deltas.slice(s![image, anchor, ..]);
            sum += target
                .iter()
                .zip(pred.iter())
                .map(|(&t, &p)| smooth_l1(t - p))
                .sum::<f32>();
            count += 4;
        }
    }
    Ok(mean(sum, count))
}

/// ROI classification: cross-entropy over every sampled ROI
///
/// * `target_class_ids` - `[batch, R]`
/// * `logits` - `[batch, R, classes]`
/// * `roi_counts` - Sampled ROIs per image; slots past the count are padding
pub fn mrcnn_class_loss(
    target_class_ids: ArrayView2<u32>,
    logits: ArrayView3<f32>,
    roi_counts: &[usize],
) -> Result<f32> {
    let (batch, rois) = target_class_ids.dim();
    let classes = logits.len_of(Axis(2));
    check("class logits", logits.shape(), &[batch, rois, classes])?;
    check("ROI counts", &[roi_counts.len()], &[batch])?;

    let mut sum = 0.0;
    let mut count = 0;
    for (image, &valid) in roi_counts.iter().enumerate() {
        for slot in 0..valid.min(rois) {
            let target = target_class_ids[[image, slot]] as usize;
            if target >= classes {
                return Err(RcnnError::Shape(format!(
                    "class id {target} outside {classes} logits"
                )));
            }
            sum += cross_entropy(logits.slice(s![image, slot, ..]), target);
            count += 1;
        }
    }
    Ok(mean(sum, count))
}

/// Positive ROIs as `(image, slot, class)`
fn positive_rois(
    target_class_ids: &ArrayView2<u32>,
    positive_counts: &[usize],
) -> Vec<(usize, usize, usize)> {
    let mut positives = Vec::new();
    for (image, &count) in positive_counts.iter().enumerate() {
        for slot in 0..count.min(target_class_ids.ncols()) {
            let class = target_class_ids[[image, slot]] as usize;
            if class > 0 {
                positives.push((image, slot, class));
            }
        }
    }
    positives
}

/// ROI regression: smooth-L1 of the ground-truth class deltas on positive ROIs
///
/// * `pred_deltas` - `[batch, R, classes, 4]`
pub fn mrcnn_bbox_loss(
    target_deltas: ArrayView3<f32>,
    target_class_ids: ArrayView2<u32>,
    pred_deltas: ArrayView4<f32>,
    positive_counts: &[usize],
) -> Result<f32> {
    let (batch, rois) = target_class_ids.dim();
    let classes = pred_deltas.len_of(Axis(2));
    check("ROI delta targets", target_deltas.shape(), &[batch, rois, 4])?;
    check("ROI deltas", pred_deltas.shape(), &[batch, rois, classes, 4])?;
    check("positive counts", &[positive_counts.len()], &[batch])?;

    let mut sum = 0.0;
    let mut count = 0;
    for (image, slot, class) in positive_rois(&target_class_ids, positive_counts) {
        if class >= classes {
            return Err(RcnnError::Shape(format!(
                "class id {class} outside {classes} predictions"
            )));
        }
        let target = target_deltas.slice(s![image, slot, ..]);
        let pred = pred_deltas.slice(s![image, slot, class, ..]);
        sum += target
            .iter()
            .zip(pred.iter())
            .map(|(&t, &p)| smooth_l1(t - p))
            .sum::<f32>();
        count += 4;
    }
    Ok(mean(sum, count))
}

/// Mask: binary cross-entropy of the ground-truth class mask on positive ROIs
///
/// * `target_masks` - `[batch, R, mh, mw]`
/// * `pred_masks` - `[batch, R, classes, mh, mw]` probabilities
pub fn mrcnn_mask_loss(
    target_masks: ArrayView4<f32>,
    target_class_ids: ArrayView2<u32>,
    pred_masks: ArrayView5<f32>,
    positive_counts: &[usize],
) -> Result<f32> {
    let (batch, rois) = target_class_ids.dim();
    let (_, _, classes, mask_h, mask_w) = pred_masks.dim();
    check("mask targets", target_masks.shape(), &[batch, rois, mask_h, mask_w])?;
    check(
        "mask predictions",
        pred_masks.shape(),
        &[batch, rois, classes, mask_h, mask_w],
    )?;
    check("positive counts", &[positive_counts.len()], &[batch])?;

    let mut sum = 0.0;
    let mut count = 0;
    for (image, slot, class) in positive_rois(&target_class_ids, positive_counts) {
        if class >= classes {
            return Err(RcnnError::Shape(format!(
                "class id {class} outside {classes} predictions"
            )));
        }
        let target = target_masks.slice(s![image, slot, .., ..]);
        let pred = pred_masks.slice(s![image, slot, class, .., ..]);
        sum += target
            .iter()
            .zip(pred.iter())
            .map(|(&t, &p)| {
                let p = p.clamp(MASK_EPS, 1.0 - MASK_EPS);
                -(t * p.ln() + (1.0 - t) * (1.0 - p).ln())
            })
            .sum::<f32>();
        count += mask_h * mask_w;
    }
    Ok(mean(sum, count))
}

/// Softmax of one logit vector
#[must_use]
pub fn softmax(logits: ArrayView1<f32>) -> Array1<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp = logits.mapv(|l| (l - max).exp());
    let total = exp.sum();
    exp / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2, Array3, Array4, Array5};

    fn assert_close(a: f32, b: f32) {
        assert!((a - b).abs() < 1e-4, "{a} != {b}");
    }

    #[test]
    fn test_rpn_class_loss_ignores_neutral() {
        let matches = array![[1i8, -1, 0]];
        let mut logits = Array3::zeros((1, 3, 2));
        // neutral anchor with a terrible prediction
        logits[[0, 2, 0]] = 100.0;
        let loss = rpn_class_loss(matches.view(), logits.view()).unwrap();
        assert_close(loss, std::f32::consts::LN_2);
    }

    #[test]
    fn test_rpn_class_loss_empty_is_zero() {
        let matches = Array2::<i8>::zeros((1, 3));
        let logits = Array3::zeros((1, 3, 2));
        assert_eq!(rpn_class_loss(matches.view(), logits.view()).unwrap(), 0.0);
    }

    #[test]
    fn test_rpn_bbox_loss_pairs_compacted_targets() {
        let matches = array![[0i8, 1, -1, 1]];
        let mut targets = Array3::zeros((1, 4, 4));
        targets[[0, 0, 0]] = 0.5;
        targets[[0, 1, 0]] = 3.0;
        let mut preds = Array3::zeros((1, 4, 4));
        preds[[0, 1, 0]] = 0.5;
        preds[[0, 3, 0]] = 1.0;

        // anchor 1 matches row 0 exactly, anchor 3 is off by 2 (smooth L1 = 1.5)
        let loss = rpn_bbox_loss(targets.view(), matches.view(), preds.view()).unwrap();
        assert_close(loss, 1.5 / 8.0);
    }

    #[test]
    fn test_mrcnn_class_loss_skips_padding() {
        let class_ids = array![[1u32, 0, 0]];
        let mut logits = Array3::zeros((1, 3, 2));
        logits[[0, 0, 1]] = 10.0;
        logits[[0, 1, 0]] = 10.0;
        logits[[0, 2, 1]] = 50.0;
        let loss = mrcnn_class_loss(class_ids.view(), logits.view(), &[2]).unwrap();
        assert!(loss < 1e-3);
    }

    #[test]
    fn test_mrcnn_bbox_loss_uses_target_class() {
        let class_ids = array![[2u32, 0]];
        let targets = Array3::from_elem((1, 2, 4), 0.5);
        let mut preds = Array4::zeros((1, 2, 3, 4));
        preds.slice_mut(s![0, 0, 2, ..]).fill(0.5);
        preds.slice_mut(s![0, 0, 1, ..]).fill(9.0);
        let loss = mrcnn_bbox_loss(targets.view(), class_ids.view(), preds.view(), &[1]).unwrap();
        assert_close(loss, 0.0);

        let none = mrcnn_bbox_loss(targets.view(), class_ids.view(), preds.view(), &[0]).unwrap();
        assert_eq!(none, 0.0);
    }

    #[test]
    fn test_losses_walk_every_image() {
        let class_ids = array![[1u32, 0], [1, 1]];
        let targets = Array3::zeros((2, 2, 4));
        let mut preds = Array4::zeros((2, 2, 2, 4));
        preds[[1, 1, 1, 0]] = 0.5;
        // counts past the ROI axis are clamped
        let loss = mrcnn_bbox_loss(targets.view(), class_ids.view(), preds.view(), &[1, 5]).unwrap();
        assert_close(loss, 0.125 / 12.0);

        let masks = Array4::from_elem((2, 2, 1, 1), 1.0);
        let pred_masks = Array5::from_elem((2, 2, 2, 1, 1), 0.5);
        let loss =
            mrcnn_mask_loss(masks.view(), class_ids.view(), pred_masks.view(), &[1, 2]).unwrap();
        assert_close(loss, std::f32::consts::LN_2);
    }

    #[test]
    fn test_rpn_bbox_loss_stops_at_target_capacity() {
        let matches = array![[1i8, 1, 1], [0, 0, 1]];
        let targets = Array3::zeros((2, 1, 4));
        let mut preds = Array3::zeros((2, 3, 4));
        // second positive of image 0 has no target row
        preds[[0, 1, 0]] = 9.0;
        preds[[1, 2, 0]] = 0.5;
        let loss = rpn_bbox_loss(targets.view(), matches.view(), preds.view()).unwrap();
        assert_close(loss, 0.125 / 8.0);
    }

    #[test]
    fn test_mrcnn_mask_loss() {
        let class_ids = array![[1u32]];
        let targets = Array4::from_elem((1, 1, 2, 2), 1.0);
        let preds = Array5::from_elem((1, 1, 2, 2, 2), 0.5);
        let loss = mrcnn_mask_loss(targets.view(), class_ids.view(), preds.view(), &[1]).unwrap();
        assert_close(loss, std::f32::consts::LN_2);
    }

    #[test]
    fn test_shape_mismatch() {
        let matches = Array2::<i8>::zeros((1, 3));
        let logits = Array3::zeros((1, 4, 2));
        assert!(matches!(
            rpn_class_loss(matches.view(), logits.view()),
            Err(RcnnError::Shape(_))
        ));
    }

    #[test]
    fn test_loss_vector_total() {
        let losses = LossVector {
            rpn_class: 1.0,
            rpn_bbox: 2.0,
            mrcnn_class: 3.0,
            mrcnn_bbox: 4.0,
            mrcnn_mask: 5.0,
        };
        assert_eq!(losses.total(), 15.0);
        assert_eq!(losses.as_array()[2], 3.0);

        let json = serde_json::to_value(losses).unwrap();
        assert_eq!(json["mrcnn_mask"], 5.0);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(array![1.0f32, 2.0, 3.0].view());
        assert_close(probs.sum(), 1.0);
        assert!(probs[2] > probs[1]);
    }
}
