//! Training targets for both detector stages
//!
//! - [`rpn`]: anchor labels and anchor regression targets
//! - [`detection`]: sampled ROIs with class, box and mask targets
//! - [`ground_truth`]: per-image instances padded into batch arrays
//! - [`sampling`]: how candidates are subsampled when over a cap

pub mod detection;
pub mod ground_truth;
pub mod rpn;
pub mod sampling;

pub use detection::{build_detection_targets, DetectionTargetSettings, DetectionTargets};
pub use ground_truth::{GroundTruthBatch, GroundTruthInstance};
pub use rpn::{build_rpn_targets, RpnTargetSettings, RpnTargets};
pub use sampling::{Sampler, STAGE_ANCHORS, STAGE_ROIS};
