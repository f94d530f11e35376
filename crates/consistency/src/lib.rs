//! Cross-scale feature consistency
//!
//! Small objects are pooled from upsampled maps, big objects from the original
//! maps. The tracker keeps a per-class history of big-object descriptors and
//! scores how far this pass's small-object descriptors are from it.

pub mod aggregate;
pub mod buffer;

pub use aggregate::{ClassAggregate, StepFeatures};
pub use buffer::{distance, BufferSnapshot, ConsistencyBuffer};
