mod common;
pub mod boxes;
pub mod nms;
pub mod roi_align;
pub mod rotated_boxes;
pub mod size;
pub mod tensor;

pub use boxes::*;
pub use nms::*;
pub use roi_align::*;
pub use rotated_boxes::*;
pub use size::*;
pub use tensor::*;
