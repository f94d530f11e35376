//! Padded ground-truth batches
//!
//! Images carry different numbers of instances. The batch stores them padded to
//! the largest count with explicit per-image `counts`; padded slots are zero and
//! are never told apart by their values.

use ndarray::{s, Array2, Array3, Array4, ArrayView3, Axis};
use pyramid_rcnn_common::{BoxCoords, RcnnError, Result};

/// One annotated object
#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruthInstance {
    /// Class id, 1.. (0 is background)
    pub class_id: u32,
    /// Box in image pixel coordinates
    pub bbox: BoxCoords,
    /// Instance mask, `[height, width]`, values in `{0, 1}`
    pub mask: Array2<f32>,
}

/// Ground truth for a batch, padded to the largest instance count
#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruthBatch {
    /// `[batch, max_instances]`
    pub class_ids: Array2<u32>,
    /// `[batch, max_instances, 4]`
    pub boxes: Array3<f32>,
    /// `[batch, max_instances, mask_height, mask_width]`
    pub masks: Array4<f32>,
    /// Valid instances per image
    pub counts: Vec<usize>,
}

impl GroundTruthBatch {
    /// Pad per-image instance lists into one batch
    ///
    /// Every mask must have the same shape.
    pub fn from_instances(images: &[Vec<GroundTruthInstance>]) -> Result<Self> {
        let max = images.iter().map(Vec::len).max().unwrap_or(0);
        let mask_shape = images
            .iter()
            .flatten()
            .next()
            .map_or((0, 0), |instance| instance.mask.dim());

        let batch = images.len();
        let mut class_ids = Array2::zeros((batch, max));
        let mut boxes = Array3::zeros((batch, max, 4));
        let mut masks = Array4::zeros((batch, max, mask_shape.0, mask_shape.1));

        for (image, instances) in images.iter().enumerate() {
            for (slot, instance) in instances.iter().enumerate() {
                if instance.mask.dim() != mask_shape {
                    return Err(RcnnError::Shape(format!(
                        "image {image} instance {slot}: mask shape {:?}, expected {mask_shape:?}",
                        instance.mask.dim()
                    )));
                }
                class_ids[[image, slot]] = instance.class_id;
                instance
                    .bbox
                    .write_row(boxes.slice_mut(s![image, slot, ..]));
                masks
                    .slice_mut(s![image, slot, .., ..])
                    .assign(&instance.mask);
            }
        }

        Ok(Self {
            class_ids,
            boxes,
            masks,
            counts: images.iter().map(Vec::len).collect(),
        })
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.counts.len()
    }

    /// `[height, width]` of the stored masks
    #[must_use]
    pub fn mask_shape(&self) -> [usize; 2] {
        let (_, _, height, width) = self.masks.dim();
        [height, width]
    }

    /// Copy with boxes divided by the image size
    #[must_use]
    pub fn normalized(&self, image_shape: [usize; 2]) -> Self {
        let mut normalized = self.clone();
        let scale = [
            image_shape[0].max(1) as f32,
            image_shape[1].max(1) as f32,
        ];
        for mut row in normalized.boxes.lanes_mut(Axis(2)) {
            row[0] /= scale[0];
            row[1] /= scale[1];
            row[2] /= scale[0];
            row[3] /= scale[1];
        }
        normalized
    }

    /// Valid boxes of one image
    #[must_use]
    pub fn image_boxes(&self, image: usize) -> Vec<BoxCoords> {
        let count = self.counts[image];
        BoxCoords::rows(self.boxes.slice(s![image, ..count, ..]))
    }

    /// Valid class ids of one image
    #[must_use]
    pub fn image_class_ids(&self, image: usize) -> Vec<u32> {
        let count = self.counts[image];
        self.class_ids.slice(s![image, ..count]).to_vec()
    }

    /// Valid masks of one image, `[count, height, width]`
    #[must_use]
    pub fn image_masks(&self, image: usize) -> ArrayView3<'_, f32> {
        let count = self.counts[image];
        self.masks.slice(s![image, ..count, .., ..])
    }

    /// Check the arrays agree on the batch size and every count fits the padding
    pub fn validate(&self) -> Result<()> {
        let batch = self.counts.len();
        let (box_batch, box_slots, coords) = self.boxes.dim();
        let (mask_batch, mask_slots, _, _) = self.masks.dim();
        if self.class_ids.nrows() != batch || box_batch != batch || mask_batch != batch {
            return Err(RcnnError::Shape(format!(
                "{batch} counts with class ids {:?}, boxes {:?} and masks {:?}",
                self.class_ids.dim(),
                self.boxes.dim(),
                self.masks.dim()
            )));
        }
        if coords != 4 {
            return Err(RcnnError::Shape(format!(
                "boxes carry {coords} coordinates, expected 4"
            )));
        }

        let slots = self.class_ids.ncols().min(box_slots).min(mask_slots);
        if let Some((image, count)) = self
            .counts
            .iter()
            .enumerate()
            .find(|(_, &count)| count > slots)
        {
            return Err(RcnnError::Shape(format!(
                "image {image}: count {count} exceeds {slots} padded slots"
            )));
        }
        Ok(())
    }

    /// Check every valid class id is a foreground class below `num_classes`
    ///
    /// Runs [`validate`](Self::validate) first.
    pub fn check_classes(&self, num_classes: usize) -> Result<()> {
        self.validate()?;
        for image in 0..self.batch_size() {
            for class_id in self.image_class_ids(image) {
                if class_id == 0 || class_id as usize >= num_classes {
                    return Err(RcnnError::Shape(format!(
                        "image {image}: class id {class_id} outside 1..{num_classes}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(class_id: u32, bbox: [f32; 4]) -> GroundTruthInstance {
        GroundTruthInstance {
            class_id,
            bbox: BoxCoords::from_array(bbox),
            mask: Array2::ones((8, 8)),
        }
    }

    #[test]
    fn test_padding_with_counts() {
        let batch = GroundTruthBatch::from_instances(&[
            vec![instance(1, [0.0, 0.0, 4.0, 4.0]), instance(2, [2.0, 2.0, 8.0, 8.0])],
            vec![],
        ])
        .unwrap();

        assert_eq!(batch.counts, vec![2, 0]);
        assert_eq!(batch.class_ids.dim(), (2, 2));
        assert_eq!(batch.masks.dim(), (2, 2, 8, 8));
        assert_eq!(batch.image_class_ids(0), vec![1, 2]);
        assert!(batch.image_boxes(1).is_empty());
        assert!(batch.masks.index_axis(Axis(0), 1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_normalized_boxes() {
        let batch =
            GroundTruthBatch::from_instances(&[vec![instance(1, [8.0, 16.0, 32.0, 64.0])]])
                .unwrap()
                .normalized([64, 128]);
        assert_eq!(
            batch.image_boxes(0)[0],
            BoxCoords::new(0.125, 0.125, 0.5, 0.5)
        );
    }

    #[test]
    fn test_mismatched_masks_rejected() {
        let mut odd = instance(1, [0.0, 0.0, 1.0, 1.0]);
        odd.mask = Array2::ones((4, 4));
        let result =
            GroundTruthBatch::from_instances(&[vec![instance(1, [0.0, 0.0, 1.0, 1.0])], vec![odd]]);
        assert!(matches!(result, Err(RcnnError::Shape(_))));
    }

    #[test]
    fn test_validate_rejects_inconsistent_batches() {
        let valid = GroundTruthBatch::from_instances(&[
            vec![instance(1, [0.0, 0.0, 4.0, 4.0])],
            vec![],
        ])
        .unwrap();
        assert!(valid.validate().is_ok());

        let mut overcounted = valid.clone();
        overcounted.counts[0] = 3;
        assert!(matches!(overcounted.validate(), Err(RcnnError::Shape(_))));
        assert!(matches!(overcounted.check_classes(2), Err(RcnnError::Shape(_))));

        let mut short_counts = valid.clone();
        short_counts.counts.pop();
        assert!(matches!(short_counts.validate(), Err(RcnnError::Shape(_))));

        let mut short_masks = valid.clone();
        short_masks.masks = Array4::zeros((1, 1, 8, 8));
        assert!(matches!(short_masks.validate(), Err(RcnnError::Shape(_))));

        let mut wide_boxes = valid;
        wide_boxes.boxes = Array3::zeros((2, 1, 5));
        assert!(matches!(wide_boxes.validate(), Err(RcnnError::Shape(_))));
    }

    #[test]
    fn test_check_classes() {
        let batch =
            GroundTruthBatch::from_instances(&[vec![instance(3, [0.0, 0.0, 1.0, 1.0])]]).unwrap();
        assert!(batch.check_classes(4).is_ok());
        assert!(batch.check_classes(3).is_err());
    }
}
