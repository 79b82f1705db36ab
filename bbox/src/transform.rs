use crate::{common::*, XYXY};

/// Axis-wise affine map `(x, y) -> (x * sx + tx, y * sy + ty)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transform<T> {
    pub sy: T,
    pub sx: T,
    pub ty: T,
    pub tx: T,
}

impl<T> Transform<T>
where
    T: Copy + Num + PartialOrd,
{
    /// The map sending the corners of `src` onto the corners of `tgt`.
    ///
    /// `src` must have non-zero width and height.
    pub fn from_rects(src: &XYXY<T>, tgt: &XYXY<T>) -> Self {
        let sy = tgt.h() / src.h();
        let sx = tgt.w() / src.w();

        Self {
            sy,
            sx,
            ty: tgt.y1() - src.y1() * sy,
            tx: tgt.x1() - src.x1() * sx,
        }
    }

    pub fn apply(&self, [x, y]: [T; 2]) -> [T; 2] {
        [x * self.sx + self.tx, y * self.sy + self.ty]
    }
}
