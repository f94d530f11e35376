//! Deterministic collaborator doubles for end-to-end tests

#![allow(dead_code)]

use ndarray::{s, Array2, Array3, Array4, ArrayView4, Axis};
use pyramid_rcnn::common::{BoxCoords, RcnnConfig, Result, SamplingPolicy};
use pyramid_rcnn::pipeline::{
    AnchorHead, AnchorHeadOutput, ClassifierHead, ClassifierOutput, Collaborators,
    FeaturePyramid, MaskHead, NormalizationMode, PyramidBackbone,
};
use pyramid_rcnn::pipeline::losses::softmax;
use pyramid_rcnn::targets::{GroundTruthBatch, GroundTruthInstance};

/// Average-pools the first image channel into one map per stride
pub struct PoolingBackbone {
    pub strides: Vec<usize>,
    pub channels: usize,
}

impl PyramidBackbone for PoolingBackbone {
    fn forward(&self, images: ArrayView4<f32>, _mode: NormalizationMode) -> Result<FeaturePyramid> {
        let (batch, _, height, width) = images.dim();
        let mut levels = Vec::with_capacity(self.strides.len());
        for &stride in &self.strides {
            let (h, w) = (height / stride, width / stride);
            let mut map = Array4::zeros((batch, self.channels, h, w));
            for b in 0..batch {
                for y in 0..h {
                    for x in 0..w {
                        let cell = images.slice(s![
                            b,
                            0,
                            y * stride..(y + 1) * stride,
                            x * stride..(x + 1) * stride
                        ]);
                        let mean = cell.mean().unwrap_or(0.0);
                        for c in 0..self.channels {
                            map[[b, c, y, x]] = mean * (c + 1) as f32;
                        }
                    }
                }
            }
            levels.push(map);
        }
        Ok(FeaturePyramid::new(levels))
    }
}

/// Constant foreground logit per level, zero deltas
pub struct ConstantAnchorHead {
    pub ratios: usize,
    pub fg_logits: Vec<f32>,
}

impl AnchorHead for ConstantAnchorHead {
    fn forward(&self, level: usize, features: ArrayView4<f32>) -> Result<AnchorHeadOutput> {
        let (batch, _, height, width) = features.dim();
        let anchors = self.ratios * height * width;
        let fg = self.fg_logits.get(level).copied().unwrap_or(0.0);

        let mut logits = Array3::zeros((batch, anchors, 2));
        logits.index_axis_mut(Axis(2), 1).fill(fg);
        let probs_row = softmax(ndarray::aview1(&[0.0, fg]));
        let mut probs = Array3::zeros((batch, anchors, 2));
        probs.index_axis_mut(Axis(2), 0).fill(probs_row[0]);
        probs.index_axis_mut(Axis(2), 1).fill(probs_row[1]);

        Ok(AnchorHeadOutput {
            logits,
            probs,
            deltas: Array3::zeros((batch, anchors, 4)),
        })
    }
}

/// Logits from the crop mean: brighter crops lean to foreground class 1
pub struct MeanClassifier {
    pub classes: usize,
}

impl ClassifierHead for MeanClassifier {
    fn forward(&self, crops: ArrayView4<f32>) -> Result<ClassifierOutput> {
        let rows = crops.len_of(Axis(0));
        let mut logits = Array2::zeros((rows, self.classes));
        let mut probs = Array2::zeros((rows, self.classes));
        for (i, crop) in crops.outer_iter().enumerate() {
            let mean = crop.mean().unwrap_or(0.0);
            logits[[i, 1]] = 8.0 * mean;
            probs.row_mut(i).assign(&softmax(logits.row(i)));
        }
        Ok(ClassifierOutput {
            logits,
            probs,
            deltas: Array3::zeros((rows, self.classes, 4)),
        })
    }
}

/// Every pixel gets the sigmoid of the crop mean
pub struct SigmoidMaskHead {
    pub classes: usize,
    pub mask_shape: [usize; 2],
}

impl MaskHead for SigmoidMaskHead {
    fn forward(&self, crops: ArrayView4<f32>) -> Result<Array4<f32>> {
        let rows = crops.len_of(Axis(0));
        let [mh, mw] = self.mask_shape;
        let mut masks = Array4::zeros((rows, self.classes, mh, mw));
        for (i, crop) in crops.outer_iter().enumerate() {
            let mean = crop.mean().unwrap_or(0.0);
            masks
                .index_axis_mut(Axis(0), i)
                .fill(1.0 / (1.0 + (-mean).exp()));
        }
        Ok(masks)
    }
}

/// 64x64 single-class setup with the scale router enabled
pub fn small_config() -> RcnnConfig {
    let mut config = RcnnConfig::default();
    config.num_classes = 2;
    config.data.image_shape = [64, 64];
    config.rpn.anchor_scales = vec![8.0, 16.0, 32.0, 64.0, 128.0];
    config.rpn.pre_nms_limit = 300;
    config.rpn.post_nms_rois_training = 64;
    config.rpn.post_nms_rois_inference = 32;
    config.rpn.train_anchors_per_image = 64;
    config.rois.train_rois_per_image = 16;
    config.rois.positive_ratio = 0.33;
    config.heads.pool_size = 4;
    config.heads.mask_pool_size = 6;
    config.heads.mask_shape = [8, 8];
    config.detection.max_instances = 10;
    config.detection.min_confidence = 0.5;
    config.dev.enabled = true;
    config.dev.feat_pool_size = 4;
    config.dev.buffer_size = 2;
    config.train.sampling = SamplingPolicy::Ranked;
    config
}

pub fn collaborators(config: &RcnnConfig) -> Collaborators {
    Collaborators::new(
        Box::new(PoolingBackbone {
            strides: config.backbone.strides.clone(),
            channels: 4,
        }),
        Box::new(ConstantAnchorHead {
            ratios: config.rpn.anchor_ratios.len(),
            fg_logits: vec![-1.0, -0.5, 0.0, 0.5, 1.0],
        }),
        Box::new(MeanClassifier {
            classes: config.num_classes,
        }),
        Box::new(SigmoidMaskHead {
            classes: config.num_classes,
            mask_shape: config.heads.mask_shape,
        }),
    )
}

/// One bright 64x64 image
pub fn bright_image() -> Array4<f32> {
    Array4::from_elem((1, 3, 64, 64), 1.0)
}

/// A single class-1 instance covering the whole image
pub fn full_image_ground_truth() -> GroundTruthBatch {
    GroundTruthBatch::from_instances(&[vec![GroundTruthInstance {
        class_id: 1,
        bbox: BoxCoords::new(0.0, 0.0, 64.0, 64.0),
        mask: Array2::ones((64, 64)),
    }]])
    .expect("masks share one shape")
}

/// Install a test subscriber honouring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
