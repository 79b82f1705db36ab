//! Neural network building blocks shared by the detection heads.

mod common;

pub mod bce_with_logits_loss;
pub mod bottleneck_block;
pub mod conv_norm_2d;
pub mod cross_entropy;
pub mod grad_scale;
pub mod group_norm;
pub mod smooth_l1_loss;

pub use bce_with_logits_loss::*;
pub use bottleneck_block::*;
pub use conv_norm_2d::*;
pub use cross_entropy::*;
pub use grad_scale::*;
pub use group_norm::*;
pub use smooth_l1_loss::*;
