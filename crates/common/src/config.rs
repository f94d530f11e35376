//! Pipeline configuration
//!
//! Every section has defaults matching a 1024x1024 COCO setup, so a YAML file
//! only needs to list the values it overrides:
//!
//! ```yaml
//! num_classes: 3
//! data:
//!   image_shape: [256, 256]
//! dev:
//!   enabled: true
//!   buffer_size: 4
//! ```

use crate::{RcnnError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Full configuration of the detector pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RcnnConfig {
    /// Number of classes including background (class 0)
    pub num_classes: usize,
    pub data: DataConfig,
    pub backbone: BackboneConfig,
    pub rpn: RpnConfig,
    pub rois: RoiConfig,
    pub heads: HeadConfig,
    pub detection: DetectionConfig,
    pub dev: DevConfig,
    pub train: TrainConfig,
}

impl Default for RcnnConfig {
    fn default() -> Self {
        Self {
            num_classes: 81,
            data: DataConfig::default(),
            backbone: BackboneConfig::default(),
            rpn: RpnConfig::default(),
            rois: RoiConfig::default(),
            heads: HeadConfig::default(),
            detection: DetectionConfig::default(),
            dev: DevConfig::default(),
            train: TrainConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Molded image size `[height, width]`, each divisible by 64
    pub image_shape: [usize; 2],
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            image_shape: [1024, 1024],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    /// Stride of each pyramid level, finest first (P2..P6)
    pub strides: Vec<usize>,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            strides: vec![4, 8, 16, 32, 64],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpnConfig {
    /// Anchor side length in pixels, one per pyramid level
    pub anchor_scales: Vec<f32>,
    /// Width/height ratios shared by every level
    pub anchor_ratios: Vec<f32>,
    /// Anchor every `anchor_stride` feature-map cells
    pub anchor_stride: usize,
    pub nms_threshold: f32,
    /// Candidates kept by score before NMS
    pub pre_nms_limit: usize,
    pub post_nms_rois_training: usize,
    pub post_nms_rois_inference: usize,
    /// Sampled anchors (positive + negative) per image
    pub train_anchors_per_image: usize,
    pub positive_iou: f32,
    pub negative_iou: f32,
    pub bbox_std_dev: [f32; 4],
}

impl Default for RpnConfig {
    fn default() -> Self {
        Self {
            anchor_scales: vec![32.0, 64.0, 128.0, 256.0, 512.0],
            anchor_ratios: vec![0.5, 1.0, 2.0],
            anchor_stride: 1,
            nms_threshold: 0.7,
            pre_nms_limit: 6000,
            post_nms_rois_training: 2000,
            post_nms_rois_inference: 1000,
            train_anchors_per_image: 256,
            positive_iou: 0.7,
            negative_iou: 0.3,
            bbox_std_dev: [0.1, 0.1, 0.2, 0.2],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiConfig {
    pub train_rois_per_image: usize,
    /// Fraction of sampled ROIs reserved for positives
    pub positive_ratio: f32,
    pub positive_iou: f32,
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            train_rois_per_image: 200,
            positive_ratio: 0.33,
            positive_iou: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadConfig {
    /// Crop size fed to the classification head
    pub pool_size: usize,
    /// Crop size fed to the mask head
    pub mask_pool_size: usize,
    /// Mask head output and mask target size `[height, width]`
    pub mask_shape: [usize; 2],
    pub bbox_std_dev: [f32; 4],
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            pool_size: 7,
            mask_pool_size: 14,
            mask_shape: [28, 28],
            bbox_std_dev: [0.1, 0.1, 0.2, 0.2],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub max_instances: usize,
    pub min_confidence: f32,
    pub nms_threshold: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            max_instances: 100,
            min_confidence: 0.7,
            nms_threshold: 0.3,
        }
    }
}

/// Distance used to compare small-object and big-object descriptors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyMetric {
    /// Mean squared error
    #[default]
    Mse,
    /// Mean absolute error
    L1,
}

/// Scale router settings ("dev" branch)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevConfig {
    /// Dynamic routing with upsampling and the consistency tracker
    pub enabled: bool,
    /// Crop size of the big-object descriptor branch, must be even
    pub feat_pool_size: usize,
    /// Only 2.0 is supported
    pub upsample_factor: f32,
    pub metric: ConsistencyMetric,
    /// Ring capacity of the consistency buffer; 1 accumulates all history
    pub buffer_size: usize,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            feat_pool_size: 14,
            upsample_factor: 2.0,
            metric: ConsistencyMetric::Mse,
            buffer_size: 1,
        }
    }
}

/// How anchors and ROIs are subsampled when more candidates exist than the cap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SamplingPolicy {
    /// Forced matches first, then by `IoU` (positives); evenly spaced (negatives)
    #[default]
    Ranked,
    /// Forced matches first, then a seeded shuffle
    Seeded { seed: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Let normalization layers update their statistics during training
    pub learn_normalization: bool,
    pub sampling: SamplingPolicy,
}

impl RcnnConfig {
    /// Parse a YAML document and validate it
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    /// Image area in pixels
    #[must_use]
    pub fn image_area(&self) -> f32 {
        (self.data.image_shape[0] * self.data.image_shape[1]) as f32
    }

    /// Feature-map shape `[height, width]` of every pyramid level
    #[must_use]
    pub fn backbone_shapes(&self) -> Vec<[usize; 2]> {
        let [height, width] = self.data.image_shape;
        self.backbone
            .strides
            .iter()
            .map(|&stride| {
                let stride = stride.max(1);
                [height.div_ceil(stride), width.div_ceil(stride)]
            })
            .collect()
    }

    /// Check every static constraint of the pipeline
    pub fn validate(&self) -> Result<()> {
        let [height, width] = self.data.image_shape;
        if height == 0 || width == 0 || height % 64 != 0 || width % 64 != 0 {
            return Err(RcnnError::Config(format!(
                "image size must be divisible by 2 at least 6 times to avoid fractions \
                 when downscaling and upscaling, got {height}x{width}"
            )));
        }

        let levels = self.backbone.strides.len();
        if levels < crate::LEVEL_MAX - crate::LEVEL_MIN + 1 {
            return Err(RcnnError::Config(format!(
                "at least {} pyramid levels required, got {levels}",
                crate::LEVEL_MAX - crate::LEVEL_MIN + 1
            )));
        }
        if self.backbone.strides.iter().any(|&s| s == 0) {
            return Err(RcnnError::Config("backbone strides must be positive".to_string()));
        }
        if self.rpn.anchor_scales.len() != levels {
            return Err(RcnnError::Config(format!(
                "{} anchor scales for {levels} pyramid levels",
                self.rpn.anchor_scales.len()
            )));
        }
        if self.rpn.anchor_scales.iter().any(|&s| s <= 0.0)
            || self.rpn.anchor_ratios.is_empty()
            || self.rpn.anchor_ratios.iter().any(|&r| r <= 0.0)
        {
            return Err(RcnnError::Config(
                "anchor scales and ratios must be non-empty and positive".to_string(),
            ));
        }
        if self.rpn.anchor_stride == 0 {
            return Err(RcnnError::Config("anchor stride must be positive".to_string()));
        }
        if self.rpn.negative_iou > self.rpn.positive_iou {
            return Err(RcnnError::Config(format!(
                "negative IoU {} above positive IoU {}",
                self.rpn.negative_iou, self.rpn.positive_iou
            )));
        }
        for (name, threshold) in [
            ("rpn.nms_threshold", self.rpn.nms_threshold),
            ("detection.nms_threshold", self.detection.nms_threshold),
            ("rois.positive_iou", self.rois.positive_iou),
        ] {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(RcnnError::Config(format!(
                    "{name} must be within [0, 1], got {threshold}"
                )));
            }
        }
        if self.rois.positive_ratio <= 0.0 || self.rois.positive_ratio > 1.0 {
            return Err(RcnnError::Config(format!(
                "rois.positive_ratio must be within (0, 1], got {}",
                self.rois.positive_ratio
            )));
        }
        if self.rpn.post_nms_rois_training == 0
            || self.rpn.post_nms_rois_inference == 0
            || self.rois.train_rois_per_image == 0
            || self.detection.max_instances == 0
        {
            return Err(RcnnError::Config("ROI and proposal counts must be positive".to_string()));
        }
        if self.heads.pool_size == 0
            || self.heads.mask_pool_size == 0
            || self.heads.mask_shape.iter().any(|&s| s == 0)
        {
            return Err(RcnnError::Config("pool and mask sizes must be positive".to_string()));
        }
        if self.num_classes < 2 {
            return Err(RcnnError::Config(format!(
                "num_classes counts background and must be at least 2, got {}",
                self.num_classes
            )));
        }
        if self.dev.upsample_factor != 2.0 {
            return Err(RcnnError::Config(format!(
                "unsupported upsampling factor {}",
                self.dev.upsample_factor
            )));
        }
        if self.dev.feat_pool_size == 0 || self.dev.feat_pool_size % 2 != 0 {
            return Err(RcnnError::Config(format!(
                "pool size of feature branch has to be even, got {}",
                self.dev.feat_pool_size
            )));
        }
        if self.dev.buffer_size == 0 {
            return Err(RcnnError::Config("dev.buffer_size must be at least 1".to_string()));
        }

        Ok(())
    }
}
