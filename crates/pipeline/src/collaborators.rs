//! Seams to the learned networks
//!
//! The pipeline only orchestrates. The backbone, the anchor head and the two
//! ROI heads are supplied by the caller behind these traits.

use ndarray::{concatenate, Array2, Array3, Array4, ArrayView3, ArrayView4, Axis};
use pyramid_rcnn_common::{RcnnError, Result, LEVEL_MAX, LEVEL_MIN};
use pyramid_rcnn_roi_pooling::{
    BilinearUpsampler, DescriptorTrunk, FeatureUpsampler, MeanPoolTrunk,
};
use serde::{Deserialize, Serialize};

/// How normalization layers of the backbone behave during a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizationMode {
    /// Use stored statistics
    Frozen,
    /// Update statistics from the batch
    Learning,
}

/// Backbone output, finest level first (P2, P3, ...)
#[derive(Debug, Clone, PartialEq)]
pub struct FeaturePyramid {
    /// `[batch, channels, height, width]` per level
    pub levels: Vec<Array4<f32>>,
}

impl FeaturePyramid {
    #[must_use]
    pub fn new(levels: Vec<Array4<f32>>) -> Self {
        Self { levels }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// P2..P5, the levels ROI pooling reads from
    pub fn pooled_levels(&self) -> Result<&[Array4<f32>]> {
        let count = LEVEL_MAX - LEVEL_MIN + 1;
        self.levels.get(..count).ok_or_else(|| {
            RcnnError::Shape(format!(
                "pyramid has {} levels, ROI pooling needs {count}",
                self.levels.len()
            ))
        })
    }
}

pub trait PyramidBackbone: Send + Sync {
    /// Images `[batch, channels, height, width]` to feature maps P2..P6
    fn forward(&self, images: ArrayView4<f32>, mode: NormalizationMode) -> Result<FeaturePyramid>;
}

/// Anchor scores and deltas of one or more levels, in catalogue order
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorHeadOutput {
    /// `[batch, anchors, 2]` background/foreground logits
    pub logits: Array3<f32>,
    /// `[batch, anchors, 2]`
    pub probs: Array3<f32>,
    /// `[batch, anchors, 4]`
    pub deltas: Array3<f32>,
}

impl AnchorHeadOutput {
    /// Join per-level outputs along the anchor axis
    pub fn concat(parts: &[AnchorHeadOutput]) -> Result<Self> {
        let logits: Vec<ArrayView3<f32>> = parts.iter().map(|p| p.logits.view()).collect();
        let probs: Vec<ArrayView3<f32>> = parts.iter().map(|p| p.probs.view()).collect();
        let deltas: Vec<ArrayView3<f32>> = parts.iter().map(|p| p.deltas.view()).collect();
        Ok(Self {
            logits: concatenate(Axis(1), &logits)?,
            probs: concatenate(Axis(1), &probs)?,
            deltas: concatenate(Axis(1), &deltas)?,
        })
    }

    #[must_use]
    pub fn num_anchors(&self) -> usize {
        self.logits.len_of(Axis(1))
    }
}

pub trait AnchorHead: Send + Sync {
    /// Scores and deltas for every anchor of pyramid level `level` (0 = P2)
    fn forward(&self, level: usize, features: ArrayView4<f32>) -> Result<AnchorHeadOutput>;
}

/// Classification head output for `N` ROIs and `K` classes
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierOutput {
    /// `[N, K]`
    pub logits: Array2<f32>,
    /// `[N, K]`
    pub probs: Array2<f32>,
    /// `[N, K, 4]`
    pub deltas: Array3<f32>,
}

pub trait ClassifierHead: Send + Sync {
    fn forward(&self, crops: ArrayView4<f32>) -> Result<ClassifierOutput>;
}

pub trait MaskHead: Send + Sync {
    /// Crops `[N, C, m, m]` to per-class mask probabilities `[N, K, mh, mw]`
    fn forward(&self, crops: ArrayView4<f32>) -> Result<Array4<f32>>;
}

/// Every external network the pipeline calls
pub struct Collaborators {
    pub backbone: Box<dyn PyramidBackbone>,
    pub anchor_head: Box<dyn AnchorHead>,
    pub classifier: Box<dyn ClassifierHead>,
    pub mask_head: Box<dyn MaskHead>,
    pub upsampler: Box<dyn FeatureUpsampler>,
    pub trunk: Box<dyn DescriptorTrunk>,
}

impl Collaborators {
    /// Collaborators with the parameter-free router upsampler and trunk
    #[must_use]
    pub fn new(
        backbone: Box<dyn PyramidBackbone>,
        anchor_head: Box<dyn AnchorHead>,
        classifier: Box<dyn ClassifierHead>,
        mask_head: Box<dyn MaskHead>,
    ) -> Self {
        Self {
            backbone,
            anchor_head,
            classifier,
            mask_head,
            upsampler: Box::new(BilinearUpsampler),
            trunk: Box::new(MeanPoolTrunk),
        }
    }

    /// Replace the router's upsampler and descriptor trunk
    #[must_use]
    pub fn with_router_parts(
        mut self,
        upsampler: Box<dyn FeatureUpsampler>,
        trunk: Box<dyn DescriptorTrunk>,
    ) -> Self {
        self.upsampler = upsampler;
        self.trunk = trunk;
        self
    }
}
