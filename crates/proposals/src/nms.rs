//! Greedy non-maximum suppression

use pyramid_rcnn_common::BoxCoords;
use std::cmp::Ordering;

/// Indices of `scores` sorted by score (highest first), ties by index
#[must_use]
pub fn rank_by_score(scores: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });
    order
}

/// Greedy NMS
///
/// The highest-scoring box is kept, every remaining box whose `IoU` with it is
/// above `iou_threshold` is discarded, and the process repeats until
/// `max_keep` boxes are kept or the candidates run out.
///
/// Returns indices into `boxes`, highest score first.
#[must_use]
pub fn non_max_suppression(
    boxes: &[BoxCoords],
    scores: &[f32],
    iou_threshold: f32,
    max_keep: usize,
) -> Vec<usize> {
    debug_assert_eq!(boxes.len(), scores.len());
    let order = rank_by_score(&scores[..boxes.len().min(scores.len())]);

    let mut keep = Vec::with_capacity(max_keep.min(order.len()));
    let mut suppressed = vec![false; boxes.len()];

    for (rank, &i) in order.iter().enumerate() {
        if keep.len() >= max_keep {
            break;
        }
        if suppressed[i] {
            continue;
        }
        keep.push(i);

        for &j in &order[rank + 1..] {
            if !suppressed[j] && boxes[i].iou(&boxes[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// NMS applied independently per class
///
/// Returns indices into `boxes`, highest score first across all classes.
#[must_use]
pub fn classwise_nms(
    boxes: &[BoxCoords],
    scores: &[f32],
    class_ids: &[u32],
    iou_threshold: f32,
) -> Vec<usize> {
    let mut classes: Vec<u32> = class_ids.to_vec();
    classes.sort_unstable();
    classes.dedup();

    let mut kept = Vec::new();
    for class_id in classes {
        let members: Vec<usize> = (0..class_ids.len())
            .filter(|&i| class_ids[i] == class_id)
            .collect();
        let member_boxes: Vec<BoxCoords> = members.iter().map(|&i| boxes[i]).collect();
        let member_scores: Vec<f32> = members.iter().map(|&i| scores[i]).collect();

        kept.extend(
            non_max_suppression(&member_boxes, &member_scores, iou_threshold, members.len())
                .into_iter()
                .map(|k| members[k]),
        );
    }

    let kept_scores: Vec<f32> = kept.iter().map(|&i| scores[i]).collect();
    rank_by_score(&kept_scores)
        .into_iter()
        .map(|k| kept[k])
        .collect()
}
