//! Detector pipeline orchestration
//!
//! Ties anchors, proposals, target assignment, scale routing and the
//! consistency tracker together behind `MaskRcnn::forward`. The networks
//! themselves are supplied through the traits in [`collaborators`].

pub mod collaborators;
pub mod detection;
pub mod losses;
pub mod model;

pub use collaborators::{
    AnchorHead, AnchorHeadOutput, ClassifierHead, ClassifierOutput, Collaborators, FeaturePyramid,
    MaskHead, NormalizationMode, PyramidBackbone,
};
pub use detection::{refine_detections, Detection};
pub use losses::LossVector;
pub use model::{
    foreground_scores, ForwardInput, ForwardOutput, InferenceOutput, MaskRcnn, Mode, TrainOutput,
};
