//! Two-stage R-CNN detection heads: region proposals, RoI heads and post-processing.

mod common;
pub mod anchor_generator;
pub mod box_transform;
pub mod config;
pub mod matcher;
pub mod model;
pub mod postprocess;
pub mod proposal;
pub mod roi_heads;
pub mod sampling;
pub mod structures;

pub use common::{FeatureMap, LossDict};
