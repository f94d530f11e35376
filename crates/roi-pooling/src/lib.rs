//! Region pooling across the feature pyramid
//!
//! The [`ScaleRouter`] assigns every ROI to a pyramid level and crops a fixed
//! size feature patch for the classification and mask heads. In dynamic mode
//! the two finest levels are upsampled before cropping, and descriptors of
//! small and big objects are emitted for the consistency tracker.

pub mod router;
pub mod trunk;
pub mod upsample;

pub use router::{
    assign_levels, roi_level, LevelDescriptors, RoiRoute, RoutedFeatures, RouterMode, ScaleRouter,
};
pub use trunk::{DescriptorTrunk, MeanPoolTrunk};
pub use upsample::{BilinearUpsampler, FeatureUpsampler};
