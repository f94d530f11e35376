//! Common types shared by every stage of the pyramid R-CNN pipeline
//!
//! This crate holds the pieces that the stage crates agree on:
//! - Box geometry in `(y1, x1, y2, x2)` order with `IoU` and delta encoding
//! - The bilinear crop-and-resize primitive used for ROI pooling and mask targets
//! - The configuration surface loaded from YAML
//! - The error taxonomy

pub mod config;
pub mod crop;
pub mod geometry;

pub use config::{
    BackboneConfig, ConsistencyMetric, DataConfig, DetectionConfig, DevConfig, HeadConfig,
    RcnnConfig, RoiConfig, RpnConfig, SamplingPolicy, TrainConfig,
};
pub use geometry::{overlaps, BoxCoords, BoxDelta};

use thiserror::Error;

/// Additive guard for divisions whose denominator may be zero
pub const EPS: f32 = 1e-19;

/// Lowest pyramid level pooled by the ROI heads (P2)
pub const LEVEL_MIN: usize = 2;

/// Highest pyramid level pooled by the ROI heads (P5)
pub const LEVEL_MAX: usize = 5;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum RcnnError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Collaborator failed: {0}")]
    Collaborator(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Array shape error: {0}")]
    Array(#[from] ndarray::ShapeError),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, RcnnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = RcnnError::Config("unknown phase 'eval'".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: unknown phase 'eval'");

        let err = RcnnError::Shape("expected 4 levels, got 3".to_string());
        assert!(err.to_string().starts_with("Shape mismatch"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.yaml");
        let err: RcnnError = io.into();
        assert!(matches!(err, RcnnError::Io(_)));
    }
}
