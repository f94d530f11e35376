//! Pyramid R-CNN detector pipeline
//!
//! Facade over the workspace crates:
//! - [`common`]: box geometry, crop-and-resize, configuration, errors
//! - [`anchors`]: per-level anchor catalogue
//! - [`proposals`]: score ranking, NMS and proposal selection
//! - [`targets`]: anchor and ROI target assignment
//! - [`roi_pooling`]: per-ROI level routing with optional upsampling
//! - [`consistency`]: cross-scale descriptor consistency tracker
//! - [`pipeline`]: collaborator traits, losses and the `MaskRcnn` orchestrator
//!
//! ```no_run
//! use pyramid_rcnn::common::RcnnConfig;
//!
//! let config = RcnnConfig::from_yaml_file("config.yaml")?;
//! println!("{} classes", config.num_classes);
//! # Ok::<(), pyramid_rcnn::RcnnError>(())
//! ```

pub use pyramid_rcnn_anchors as anchors;
pub use pyramid_rcnn_common as common;
pub use pyramid_rcnn_consistency as consistency;
pub use pyramid_rcnn_pipeline as pipeline;
pub use pyramid_rcnn_proposals as proposals;
pub use pyramid_rcnn_roi_pooling as roi_pooling;
pub use pyramid_rcnn_targets as targets;

pub use pyramid_rcnn_common::{BoxCoords, RcnnConfig, RcnnError, Result};
pub use pyramid_rcnn_pipeline::{
    Collaborators, Detection, ForwardInput, ForwardOutput, MaskRcnn, Mode,
};
pub use pyramid_rcnn_targets::{GroundTruthBatch, GroundTruthInstance};
