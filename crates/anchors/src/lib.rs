// Pyramid anchor generation
//
// Builds the fixed catalogue of reference boxes the proposal stage refines.
// One box is emitted per (level, scale, ratio, center). The catalogue order is
// part of the contract with the anchor head: scores and deltas for level `l`
// must be laid out scale-major, then ratio, then row-major center.
//
// Geometry per anchor:
//   height = scale / sqrt(ratio),  width = scale * sqrt(ratio)
//   center = (row * feature_stride, col * feature_stride) pixels,
//            rows/cols stepping by `anchor_stride` feature cells
// Boxes are normalized by dividing by the image height/width.

use pyramid_rcnn_common::{BoxCoords, RcnnConfig, RcnnError, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::debug;

/// Anchor layout of one pyramid level
#[derive(Debug, Clone, PartialEq)]
pub struct LevelAnchorSpec {
    /// Anchor side lengths in pixels
    pub scales: Vec<f32>,
    /// Width/height ratios
    pub ratios: Vec<f32>,
    /// Feature-map shape `[height, width]`
    pub feature_shape: [usize; 2],
    /// Pixels per feature-map cell
    pub feature_stride: usize,
}

impl LevelAnchorSpec {
    fn validate(&self, level: usize) -> Result<()> {
        if self.feature_stride == 0 || self.feature_shape.iter().any(|&s| s == 0) {
            return Err(RcnnError::Config(format!(
                "level {level}: stride {} and shape {:?} must be positive",
                self.feature_stride, self.feature_shape
            )));
        }
        if self.scales.is_empty() || self.ratios.is_empty() {
            return Err(RcnnError::Config(format!(
                "level {level}: at least one scale and one ratio required"
            )));
        }
        if self.scales.iter().chain(&self.ratios).any(|&v| v <= 0.0 || !v.is_finite()) {
            return Err(RcnnError::Config(format!(
                "level {level}: scales and ratios must be positive"
            )));
        }
        Ok(())
    }

    /// Anchors this level contributes for a given center stride
    #[must_use]
    pub fn anchor_count(&self, anchor_stride: usize) -> usize {
        let stride = anchor_stride.max(1);
        self.scales.len()
            * self.ratios.len()
            * self.feature_shape[0].div_ceil(stride)
            * self.feature_shape[1].div_ceil(stride)
    }
}

/// Origin of one anchor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorTag {
    /// Pyramid level index, 0 = finest
    pub level: usize,
    pub scale: f32,
    pub ratio: f32,
}

/// One anchor with its origin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub bbox: BoxCoords,
    pub tag: AnchorTag,
}

/// Immutable, ordered anchor catalogue
#[derive(Debug, Clone)]
pub struct AnchorCatalogue {
    boxes: Vec<BoxCoords>,
    tags: Vec<AnchorTag>,
    level_ranges: Vec<Range<usize>>,
}

impl AnchorCatalogue {
    /// Generate anchors for every level
    ///
    /// # Arguments
    /// * `levels` - Per-level layout, finest first
    /// * `anchor_stride` - Emit anchors every `anchor_stride` feature cells
    /// * `image_shape` - `[height, width]` in pixels, used for normalization
    pub fn generate(
        levels: &[LevelAnchorSpec],
        anchor_stride: usize,
        image_shape: [usize; 2],
    ) -> Result<Self> {
        if anchor_stride == 0 {
            return Err(RcnnError::Config("anchor stride must be positive".to_string()));
        }
        if image_shape.iter().any(|&s| s == 0) {
            return Err(RcnnError::Config(format!(
                "image shape must be positive, got {image_shape:?}"
            )));
        }
        for (level, spec) in levels.iter().enumerate() {
            spec.validate(level)?;
        }

        let total: usize = levels.iter().map(|l| l.anchor_count(anchor_stride)).sum();
        let mut boxes = Vec::with_capacity(total);
        let mut tags = Vec::with_capacity(total);
        let mut level_ranges = Vec::with_capacity(levels.len());

        let image_h = image_shape[0] as f32;
        let image_w = image_shape[1] as f32;

        for (level, spec) in levels.iter().enumerate() {
            let start = boxes.len();
            let stride = spec.feature_stride as f32;

            for &scale in &spec.scales {
                for &ratio in &spec.ratios {
                    let height = scale / ratio.sqrt();
                    let width = scale * ratio.sqrt();

                    for row in (0..spec.feature_shape[0]).step_by(anchor_stride) {
                        let cy = row as f32 * stride;
                        for col in (0..spec.feature_shape[1]).step_by(anchor_stride) {
                            let cx = col as f32 * stride;
                            boxes.push(BoxCoords::new(
                                (cy - 0.5 * height) / image_h,
                                (cx - 0.5 * width) / image_w,
                                (cy + 0.5 * height) / image_h,
                                (cx + 0.5 * width) / image_w,
                            ));
                            tags.push(AnchorTag {
                                level,
                                scale,
                                ratio,
                            });
                        }
                    }
                }
            }

            debug!("Level {} produced {} anchors", level, boxes.len() - start);
            level_ranges.push(start..boxes.len());
        }

        Ok(Self {
            boxes,
            tags,
            level_ranges,
        })
    }

    /// Build the catalogue described by a pipeline configuration
    ///
    /// Every level gets its single configured scale combined with all ratios.
    pub fn from_config(config: &RcnnConfig) -> Result<Self> {
        config.validate()?;
        let levels: Vec<LevelAnchorSpec> = config
            .backbone
            .strides
            .iter()
            .zip(config.backbone_shapes())
            .zip(&config.rpn.anchor_scales)
            .map(|((&feature_stride, feature_shape), &scale)| LevelAnchorSpec {
                scales: vec![scale],
                ratios: config.rpn.anchor_ratios.clone(),
                feature_shape,
                feature_stride,
            })
            .collect();
        Self::generate(&levels, config.rpn.anchor_stride, config.data.image_shape)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// All boxes in catalogue order
    #[must_use]
    pub fn boxes(&self) -> &[BoxCoords] {
        &self.boxes
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<Anchor> {
        Some(Anchor {
            bbox: *self.boxes.get(index)?,
            tag: *self.tags.get(index)?,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Anchor> + '_ {
        self.boxes
            .iter()
            .zip(&self.tags)
            .map(|(&bbox, &tag)| Anchor { bbox, tag })
    }

    #[must_use]
    pub fn num_levels(&self) -> usize {
        self.level_ranges.len()
    }

    /// Catalogue indices belonging to one pyramid level
    #[must_use]
    pub fn level_range(&self, level: usize) -> Option<Range<usize>> {
        self.level_ranges.get(level).cloned()
    }
}
