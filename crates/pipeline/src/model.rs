//! Two-stage detector pass orchestration
//!
//! `MaskRcnn` wires the stage crates together around the caller's networks:
//!
//! ```text
//! images -> backbone -> anchor head -> proposals -> router -> classifier
//!   inference: -> refinement -> router -> mask head -> detections + masks
//!   train:     -> anchor/ROI targets -> router -> heads -> losses (+ consistency)
//! ```

use crate::collaborators::{
    AnchorHead, AnchorHeadOutput, ClassifierHead, ClassifierOutput, Collaborators, FeaturePyramid,
    MaskHead, NormalizationMode, PyramidBackbone,
};
use crate::detection::{refine_detections, Detection};
use crate::losses::{
    mrcnn_bbox_loss, mrcnn_class_loss, mrcnn_mask_loss, rpn_bbox_loss, rpn_class_loss, LossVector,
};
use ndarray::{s, Array2, Array3, Array4, Array5, ArrayView3, ArrayView4, Axis};
use pyramid_rcnn_anchors::AnchorCatalogue;
use pyramid_rcnn_common::{BoxCoords, RcnnConfig, RcnnError, Result};
use pyramid_rcnn_consistency::{ConsistencyBuffer, StepFeatures};
use pyramid_rcnn_proposals::{select_proposals, ProposalSettings};
use pyramid_rcnn_roi_pooling::{RoutedFeatures, RouterMode, ScaleRouter};
use pyramid_rcnn_targets::{
    build_detection_targets, build_rpn_targets, DetectionTargetSettings, GroundTruthBatch,
    RpnTargetSettings, Sampler, STAGE_ANCHORS, STAGE_ROIS,
};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Kind of forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Inference,
    Train,
}

impl FromStr for Mode {
    type Err = RcnnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inference" => Ok(Mode::Inference),
            "train" => Ok(Mode::Train),
            other => Err(RcnnError::Config(format!("unknown phase {other:?}"))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Inference => write!(f, "inference"),
            Mode::Train => write!(f, "train"),
        }
    }
}

/// Inputs of one pass
#[derive(Debug, Clone)]
pub struct ForwardInput<'a> {
    /// `[batch, channels, height, width]` at the configured image shape
    pub images: ArrayView4<'a, f32>,
    /// Per-image area holding real pixels, in pixels; the full image when absent
    pub windows: Option<Vec<BoxCoords>>,
    /// Pixel-coordinate ground truth, required for training
    pub ground_truth: Option<&'a GroundTruthBatch>,
}

impl<'a> ForwardInput<'a> {
    #[must_use]
    pub fn new(images: ArrayView4<'a, f32>) -> Self {
        Self {
            images,
            windows: None,
            ground_truth: None,
        }
    }

    #[must_use]
    pub fn with_windows(mut self, windows: Vec<BoxCoords>) -> Self {
        self.windows = Some(windows);
        self
    }

    #[must_use]
    pub fn with_ground_truth(mut self, ground_truth: &'a GroundTruthBatch) -> Self {
        self.ground_truth = Some(ground_truth);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutput {
    /// Per image, highest score first
    pub detections: Vec<Vec<Detection>>,
    /// `[batch, max_instances, classes, mask_height, mask_width]`, zero past each
    /// image's detection count
    pub masks: Array5<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutput {
    pub losses: LossVector,
    /// Big/small descriptor aggregates of this pass, present in dynamic routing
    ///
    /// The model's consistency buffer has already been stepped with these during
    /// the pass. Stepping it again with the same features counts them twice.
    pub step_features: Option<StepFeatures>,
    /// `0.0` unless the scale router's consistency tracker is enabled
    pub consistency_loss: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForwardOutput {
    Inference(InferenceOutput),
    Train(TrainOutput),
}

/// Per-anchor and per-ROI predictions shaped for the losses
struct HeadPredictions {
    /// `[batch, R, classes]`
    logits: Array3<f32>,
    /// `[batch, R, classes, 4]`
    deltas: Array4<f32>,
    /// `[batch, R, classes, mask_height, mask_width]`
    masks: Array5<f32>,
}

/// Detector pipeline with its consistency state
pub struct MaskRcnn {
    config: RcnnConfig,
    anchors: AnchorCatalogue,
    router: ScaleRouter,
    buffer: ConsistencyBuffer,
    backbone: Box<dyn PyramidBackbone>,
    anchor_head: Box<dyn AnchorHead>,
    classifier: Box<dyn ClassifierHead>,
    mask_head: Box<dyn MaskHead>,
}

impl fmt::Debug for MaskRcnn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaskRcnn")
            .field("anchors", &self.anchors.len())
            .field("router", &self.router)
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

impl MaskRcnn {
    /// Validate the configuration and build the anchor catalogue and router
    pub fn new(config: RcnnConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            backbone,
            anchor_head,
            classifier,
            mask_head,
            upsampler,
            trunk,
        } = collaborators;

        let anchors = AnchorCatalogue::from_config(&config)?;
        let router = ScaleRouter::new(&config, upsampler, trunk)?;
        let buffer = ConsistencyBuffer::from_config(&config)?;
        info!(
            "Detector ready: {} anchors over {} levels, {:?} routing",
            anchors.len(),
            anchors.num_levels(),
            router.mode()
        );

        Ok(Self {
            config,
            anchors,
            router,
            buffer,
            backbone,
            anchor_head,
            classifier,
            mask_head,
        })
    }

    #[must_use]
    pub fn config(&self) -> &RcnnConfig {
        &self.config
    }

    #[must_use]
    pub fn anchors(&self) -> &AnchorCatalogue {
        &self.anchors
    }

    #[must_use]
    pub fn router(&self) -> &ScaleRouter {
        &self.router
    }

    #[must_use]
    pub fn buffer(&self) -> &ConsistencyBuffer {
        &self.buffer
    }

    /// Mutable access for resetting or restoring the consistency state
    pub fn buffer_mut(&mut self) -> &mut ConsistencyBuffer {
        &mut self.buffer
    }

    /// Run a pass named `"inference"` or `"train"`
    pub fn forward_named(&mut self, mode: &str, input: ForwardInput<'_>) -> Result<ForwardOutput> {
        self.forward(mode.parse()?, input)
    }

    /// Run one pass
    ///
    /// Training passes update the consistency buffer when it is enabled.
    pub fn forward(&mut self, mode: Mode, input: ForwardInput<'_>) -> Result<ForwardOutput> {
        match mode {
            Mode::Inference => self.infer(&input).map(ForwardOutput::Inference),
            Mode::Train => self.train(&input).map(ForwardOutput::Train),
        }
    }

    fn check_images(&self, images: ArrayView4<f32>) -> Result<usize> {
        let (batch, _, height, width) = images.dim();
        if [height, width] != self.config.data.image_shape {
            return Err(RcnnError::Shape(format!(
                "images are {height}x{width}, configured for {:?}",
                self.config.data.image_shape
            )));
        }
        if batch == 0 {
            return Err(RcnnError::MissingInput("empty image batch".to_string()));
        }
        Ok(batch)
    }

    /// Backbone and anchor head over every level, concatenated in catalogue order
    fn run_anchor_head(
        &self,
        images: ArrayView4<f32>,
        normalization: NormalizationMode,
    ) -> Result<(FeaturePyramid, AnchorHeadOutput)> {
        let pyramid = self.backbone.forward(images, normalization)?;
        if pyramid.len() != self.anchors.num_levels() {
            return Err(RcnnError::Shape(format!(
                "backbone returned {} levels, anchors cover {}",
                pyramid.len(),
                self.anchors.num_levels()
            )));
        }

        let mut parts = Vec::with_capacity(pyramid.len());
        for (level, map) in pyramid.levels.iter().enumerate() {
            let output = self.anchor_head.forward(level, map.view())?;
            let expected = self.anchors.level_range(level).map_or(0, |r| r.len());
            if output.num_anchors() != expected {
                return Err(RcnnError::Shape(format!(
                    "anchor head returned {} anchors on level {level}, catalogue has {expected}",
                    output.num_anchors()
                )));
            }
            parts.push(output);
        }
        Ok((pyramid, AnchorHeadOutput::concat(&parts)?))
    }

    fn proposals(
        &self,
        anchor_output: &AnchorHeadOutput,
        settings: &ProposalSettings,
    ) -> Result<Array3<f32>> {
        let fg_scores = foreground_scores(anchor_output.probs.view());
        select_proposals(
            fg_scores.view(),
            anchor_output.deltas.view(),
            &self.anchors,
            settings,
        )
    }

    fn classify(&self, crops: ArrayView4<f32>) -> Result<ClassifierOutput> {
        let rows = crops.len_of(Axis(0));
        let classes = self.config.num_classes;
        let output = self.classifier.forward(crops)?;
        if output.logits.dim() != (rows, classes)
            || output.probs.dim() != (rows, classes)
            || output.deltas.dim() != (rows, classes, 4)
        {
            return Err(RcnnError::Shape(format!(
                "classifier returned logits {:?}, probs {:?}, deltas {:?} for {rows} crops \
                 and {classes} classes",
                output.logits.dim(),
                output.probs.dim(),
                output.deltas.dim()
            )));
        }
        Ok(output)
    }

    fn segment(&self, crops: ArrayView4<f32>) -> Result<Array4<f32>> {
        let rows = crops.len_of(Axis(0));
        let [mask_h, mask_w] = self.config.heads.mask_shape;
        let expected = (rows, self.config.num_classes, mask_h, mask_w);
        let masks = self.mask_head.forward(crops)?;
        if masks.dim() != expected {
            return Err(RcnnError::Shape(format!(
                "mask head returned {:?}, expected {expected:?}",
                masks.dim()
            )));
        }
        Ok(masks)
    }

    fn windows(&self, batch: usize, windows: Option<&Vec<BoxCoords>>) -> Result<Vec<BoxCoords>> {
        match windows {
            Some(windows) if windows.len() == batch => {
                if let Some((image, window)) =
                    windows.iter().enumerate().find(|(_, w)| !w.is_ordered())
                {
                    return Err(RcnnError::Shape(format!(
                        "image {image}: window {:?} is not an ordered finite box",
                        window.to_array()
                    )));
                }
                Ok(windows.clone())
            }
            Some(windows) => Err(RcnnError::Shape(format!(
                "{} windows for {batch} images",
                windows.len()
            ))),
            None => {
                let [height, width] = self.config.data.image_shape;
                Ok(vec![
                    BoxCoords::new(0.0, 0.0, height as f32, width as f32);
                    batch
                ])
            }
        }
    }

    fn infer(&self, input: &ForwardInput<'_>) -> Result<InferenceOutput> {
        let batch = self.check_images(input.images)?;
        let windows = self.windows(batch, input.windows.as_ref())?;

        let (pyramid, anchor_output) = self.run_anchor_head(input.images, NormalizationMode::Frozen)?;
        let proposals = self.proposals(&anchor_output, &ProposalSettings::inference(&self.config))?;
        let slots = proposals.len_of(Axis(1));

        let pyramid = pyramid.pooled_levels()?;
        let routed = self.router.route(pyramid, proposals.view(), None)?;
        let classified = self.classify(routed.classifier.view())?;
        let probs = classified.probs.to_shape((batch, slots, self.config.num_classes))?;
        let deltas = classified
            .deltas
            .to_shape((batch, slots, self.config.num_classes, 4))?;

        let mut detections = Vec::with_capacity(batch);
        for (image, window) in windows.iter().enumerate() {
            detections.push(refine_detections(
                proposals.index_axis(Axis(0), image),
                probs.index_axis(Axis(0), image),
                deltas.index_axis(Axis(0), image),
                window,
                &self.config,
            )?);
        }

        let masks = self.detection_masks(pyramid, &detections)?;
        info!(
            "Inference pass: {} images, {} detections",
            batch,
            detections.iter().map(Vec::len).sum::<usize>()
        );
        Ok(InferenceOutput { detections, masks })
    }

    /// Route the refined boxes again and run the mask head on them
    fn detection_masks(
        &self,
        pyramid: &[Array4<f32>],
        detections: &[Vec<Detection>],
    ) -> Result<Array5<f32>> {
        let batch = detections.len();
        let max_instances = self.config.detection.max_instances;
        let classes = self.config.num_classes;
        let [mask_h, mask_w] = self.config.heads.mask_shape;
        let mut masks = Array5::zeros((batch, max_instances, classes, mask_h, mask_w));

        if detections.iter().all(Vec::is_empty) {
            debug!("No detections, mask head skipped");
            return Ok(masks);
        }

        let [height, width] = self.config.data.image_shape;
        let mut rois = Array3::zeros((batch, max_instances, 4));
        for (image, image_detections) in detections.iter().enumerate() {
            for (slot, detection) in image_detections.iter().enumerate() {
                detection
                    .bbox
                    .scale(1.0 / height as f32, 1.0 / width as f32)
                    .write_row(rois.slice_mut(s![image, slot, ..]));
            }
        }

        let routed = self.router.route(pyramid, rois.view(), None)?;
        let predicted = self.segment(routed.mask.view())?;
        for (image, image_detections) in detections.iter().enumerate() {
            for slot in 0..image_detections.len() {
                masks
                    .slice_mut(s![image, slot, .., .., ..])
                    .assign(&predicted.index_axis(Axis(0), image * max_instances + slot));
            }
        }
        Ok(masks)
    }

    fn train(&mut self, input: &ForwardInput<'_>) -> Result<TrainOutput> {
        let batch = self.check_images(input.images)?;
        let ground_truth = input.ground_truth.ok_or_else(|| {
            RcnnError::MissingInput("training pass needs ground truth".to_string())
        })?;
        ground_truth.validate()?;
        if ground_truth.batch_size() != batch {
            return Err(RcnnError::Shape(format!(
                "ground truth for {} images, batch has {batch}",
                ground_truth.batch_size()
            )));
        }
        ground_truth.check_classes(self.config.num_classes)?;
        if ground_truth.counts.iter().all(|&c| c == 0) {
            warn!("Training batch has no ground-truth instances");
        }
        let ground_truth = ground_truth.normalized(self.config.data.image_shape);

        let normalization = if self.config.train.learn_normalization {
            NormalizationMode::Learning
        } else {
            NormalizationMode::Frozen
        };
        let (pyramid, anchor_output) = self.run_anchor_head(input.images, normalization)?;
        let proposals = self.proposals(&anchor_output, &ProposalSettings::training(&self.config))?;

        let policy = self.config.train.sampling;
        let rpn_targets = build_rpn_targets(
            &self.anchors,
            &ground_truth,
            &RpnTargetSettings::from_config(&self.config),
            &Sampler::new(policy, STAGE_ANCHORS),
        )?;
        let targets = build_detection_targets(
            proposals.view(),
            &ground_truth,
            &DetectionTargetSettings::from_config(&self.config),
            &Sampler::new(policy, STAGE_ROIS),
        )?;
        debug!(
            "Sampled ROIs {:?}, positives {:?}",
            targets.roi_counts, targets.positive_counts
        );

        let (predictions, routed) = if targets.is_empty() {
            debug!("Every sampled ROI is empty, heads skipped");
            (self.empty_predictions(batch, targets.rois.len_of(Axis(1))), None)
        } else {
            let routed = self.router.route(
                pyramid.pooled_levels()?,
                targets.rois.view(),
                Some(targets.class_ids.view()),
            )?;
            (self.head_predictions(batch, &routed)?, Some(routed))
        };

        let losses = LossVector {
            rpn_class: rpn_class_loss(rpn_targets.matches.view(), anchor_output.logits.view())?,
            rpn_bbox: rpn_bbox_loss(
                rpn_targets.deltas.view(),
                rpn_targets.matches.view(),
                anchor_output.deltas.view(),
            )?,
            mrcnn_class: mrcnn_class_loss(
                targets.class_ids.view(),
                predictions.logits.view(),
                &targets.roi_counts,
            )?,
            mrcnn_bbox: mrcnn_bbox_loss(
                targets.deltas.view(),
                targets.class_ids.view(),
                predictions.deltas.view(),
                &targets.positive_counts,
            )?,
            mrcnn_mask: mrcnn_mask_loss(
                targets.masks.view(),
                targets.class_ids.view(),
                predictions.masks.view(),
                &targets.positive_counts,
            )?,
        };

        let (step_features, consistency_loss) = match self.router.mode() {
            RouterMode::Dynamic => {
                let levels = routed.as_ref().map_or(&[][..], |r| &r.descriptors[..]);
                let features = StepFeatures::from_levels(levels, self.config.num_classes)?;
                let loss = self.buffer.step(&features)?;
                (Some(features), loss)
            }
            RouterMode::Fixed => (None, 0.0),
        };

        info!(
            "Train pass: {} images, losses {:?}, consistency {:.6}",
            batch,
            losses.as_array(),
            consistency_loss
        );
        Ok(TrainOutput {
            losses,
            step_features,
            consistency_loss,
        })
    }

    fn empty_predictions(&self, batch: usize, rois: usize) -> HeadPredictions {
        let classes = self.config.num_classes;
        let [mask_h, mask_w] = self.config.heads.mask_shape;
        HeadPredictions {
            logits: Array3::zeros((batch, rois, classes)),
            deltas: Array4::zeros((batch, rois, classes, 4)),
            masks: Array5::zeros((batch, rois, classes, mask_h, mask_w)),
        }
    }

    fn head_predictions(&self, batch: usize, routed: &RoutedFeatures) -> Result<HeadPredictions> {
        let rows = routed.classifier.len_of(Axis(0));
        let rois = rows / batch;
        let classes = self.config.num_classes;
        let [mask_h, mask_w] = self.config.heads.mask_shape;

        let classified = self.classify(routed.classifier.view())?;
        let masks = self.segment(routed.mask.view())?;
        Ok(HeadPredictions {
            logits: classified
                .logits
                .to_shape((batch, rois, classes))?
                .into_owned(),
            deltas: classified
                .deltas
                .to_shape((batch, rois, classes, 4))?
                .into_owned(),
            masks: masks
                .to_shape((batch, rois, classes, mask_h, mask_w))?
                .into_owned(),
        })
    }
}

/// Foreground column of anchor probabilities `[batch, anchors, 2]`
#[must_use]
pub fn foreground_scores(probs: ArrayView3<f32>) -> Array2<f32> {
    probs.index_axis(Axis(2), 1).to_owned()
}
