use crate::{common::*, polygon::Polygon, XYXY};

/// Rotated rectangle in (cx, cy, w, h, angle) format.
///
/// The angle is in degrees, counter-clockwise in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotatedRect<T> {
    pub(crate) cx: T,
    pub(crate) cy: T,
    pub(crate) w: T,
    pub(crate) h: T,
    pub(crate) angle: T,
}

impl<T> RotatedRect<T>
where
    T: Float + FloatConst,
{
    pub fn try_from_cxcywha(params: [T; 5]) -> Result<Self> {
        let [cx, cy, w, h, angle] = params;
        ensure!(
            w >= T::zero() && h >= T::zero(),
            "w and h must be non-negative"
        );
        Ok(Self {
            cx,
            cy,
            w,
            h,
            angle,
        })
    }

    pub fn from_cxcywha(params: [T; 5]) -> Self {
        Self::try_from_cxcywha(params).unwrap()
    }

    pub fn cx(&self) -> T {
        self.cx
    }

    pub fn cy(&self) -> T {
        self.cy
    }

    pub fn w(&self) -> T {
        self.w
    }

    pub fn h(&self) -> T {
        self.h
    }

    pub fn angle(&self) -> T {
        self.angle
    }

    pub fn area(&self) -> T {
        self.w * self.h
    }

    /// Shift the angle into `[-180, 180)`.
    pub fn normalize_angle(&self) -> Self {
        let full = T::from(360.0).unwrap();
        let half = T::from(180.0).unwrap();
        let angle = (self.angle + half) % full;
        let angle = if angle < T::zero() { angle + full } else { angle } - half;
        Self { angle, ..*self }
    }

    pub fn translate(&self, dx: T, dy: T) -> Self {
        Self {
            cx: self.cx + dx,
            cy: self.cy + dy,
            ..*self
        }
    }

    /// The four vertices in drawing order.
    pub fn corners(&self) -> [[T; 2]; 4] {
        let Self {
            cx, cy, w, h, angle, ..
        } = *self;
        let half = T::from(0.5).unwrap();
        let theta = angle * T::PI() / T::from(180.0).unwrap();
        let b = theta.cos() * half;
        let a = theta.sin() * half;

        let p0 = [cx - a * h - b * w, cy + b * h - a * w];
        let p1 = [cx + a * h - b * w, cy - b * h - a * w];
        let p2 = [cx + cx - p0[0], cy + cy - p0[1]];
        let p3 = [cx + cx - p1[0], cy + cy - p1[1]];
        [p0, p1, p2, p3]
    }

    pub fn to_polygon(&self) -> Polygon<T> {
        Polygon::new(self.corners().to_vec())
    }

    /// The smallest axis-aligned box enclosing the rectangle.
    pub fn bounding_box(&self) -> XYXY<T> {
        let corners = self.corners();
        let init = (corners[0][0], corners[0][1], corners[0][0], corners[0][1]);
        let (x1, y1, x2, y2) = corners[1..]
            .iter()
            .fold(init, |(x1, y1, x2, y2), &[x, y]| {
                (x1.min(x), y1.min(y), x2.max(x), y2.max(y))
            });
        XYXY { x1, y1, x2, y2 }
    }

    pub fn intersection_area_with(&self, other: &Self) -> T {
        // shift both rectangles near the origin for numeric precision
        let two = T::one() + T::one();
        let sx = (self.cx + other.cx) / two;
        let sy = (self.cy + other.cy) / two;
        let lhs = self.translate(-sx, -sy).to_polygon();
        let rhs = other.translate(-sx, -sy).to_polygon();
        lhs.convex_intersection_area(&rhs)
    }

    pub fn iou_with(&self, other: &Self) -> T {
        let area1 = self.area();
        let area2 = other.area();
        if area1 * area2 < T::from(1e-14).unwrap() {
            return T::zero();
        }
        let inter = self.intersection_area_with(other);
        if inter <= T::zero() {
            return T::zero();
        }
        inter / (area1 + area2 - inter)
    }
}

impl<T> From<&XYXY<T>> for RotatedRect<T>
where
    T: Copy + Num + PartialOrd,
{
    fn from(from: &XYXY<T>) -> Self {
        Self {
            cx: from.cx(),
            cy: from.cy(),
            w: from.w(),
            h: from.h(),
            angle: T::zero(),
        }
    }
}
