//! Data structures shared by proposal generators and RoI heads.

mod image_list;
mod instances;
mod instances_list;
mod keypoints;
mod masks;
mod shape_spec;

pub use image_list::*;
pub use instances::*;
pub use instances_list::*;
pub use keypoints::*;
pub use masks::*;
pub use shape_spec::*;
