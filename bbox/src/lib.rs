//! Safe scalar box types and geometry functions.

mod common;

pub use xyxy::*;
pub mod xyxy;

pub use rotated::*;
pub mod rotated;

pub use polygon::*;
pub mod polygon;

pub use transform::*;
mod transform;

pub use hw::*;
pub mod hw;

pub mod prelude {
    pub use crate::{polygon::Polygon, rotated::RotatedRect, xyxy::XYXY};
}
