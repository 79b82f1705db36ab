use crate::common::*;

/// Image size in pixels, (height, width).
pub type ImageSize = HW<i64>;

pub trait ImageSizeExt {
    fn new_size(h: i64, w: i64) -> Result<ImageSize>;

    /// Ratio `(scale_y, scale_x)` mapping this size onto `other`.
    fn scale_to(&self, other: &ImageSize) -> (f64, f64);
}

impl ImageSizeExt for ImageSize {
    fn new_size(h: i64, w: i64) -> Result<ImageSize> {
        HW::try_from_hw([h, w])
    }

    fn scale_to(&self, other: &ImageSize) -> (f64, f64) {
        (
            other.h() as f64 / self.h() as f64,
            other.w() as f64 / self.w() as f64,
        )
    }
}
