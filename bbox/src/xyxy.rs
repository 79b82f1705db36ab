use crate::{common::*, polygon::Polygon};

/// Axis-aligned bounding box in XYXY format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XYXY<T> {
    pub(crate) x1: T,
    pub(crate) y1: T,
    pub(crate) x2: T,
    pub(crate) y2: T,
}

impl<T> XYXY<T>
where
    T: Copy + Num + PartialOrd,
{
    pub fn try_from_xyxy(xyxy: [T; 4]) -> Result<Self> {
        let [x1, y1, x2, y2] = xyxy;
        ensure!(x2 >= x1 && y2 >= y1, "x2 >= x1 and y2 >= y1 must hold");
        Ok(Self { x1, y1, x2, y2 })
    }

    pub fn try_from_xywh(xywh: [T; 4]) -> Result<Self> {
        let [x1, y1, w, h] = xywh;
        Self::try_from_xyxy([x1, y1, x1 + w, y1 + h])
    }

    pub fn from_xyxy(xyxy: [T; 4]) -> Self {
        Self::try_from_xyxy(xyxy).unwrap()
    }

    pub fn x1(&self) -> T {
        self.x1
    }

    pub fn y1(&self) -> T {
        self.y1
    }

    pub fn x2(&self) -> T {
        self.x2
    }

    pub fn y2(&self) -> T {
        self.y2
    }

    pub fn w(&self) -> T {
        self.x2 - self.x1
    }

    pub fn h(&self) -> T {
        self.y2 - self.y1
    }

    pub fn cx(&self) -> T {
        let two = T::one() + T::one();
        self.x1 + self.w() / two
    }

    pub fn cy(&self) -> T {
        let two = T::one() + T::one();
        self.y1 + self.h() / two
    }

    pub fn xyxy(&self) -> [T; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    pub fn area(&self) -> T {
        self.w() * self.h()
    }

    /// Both sides are strictly greater than `threshold`.
    pub fn is_nonempty(&self, threshold: T) -> bool {
        self.w() > threshold && self.h() > threshold
    }

    /// Compute the intersection box, or `None` if the boxes do not overlap.
    pub fn intersect_with(&self, other: &Self) -> Option<Self> {
        let max = |a: T, b: T| if a >= b { a } else { b };
        let min = |a: T, b: T| if a <= b { a } else { b };

        let x1 = max(self.x1, other.x1);
        let y1 = max(self.y1, other.y1);
        let x2 = min(self.x2, other.x2);
        let y2 = min(self.y2, other.y2);

        (x2 > x1 && y2 > y1).then(|| Self { x1, y1, x2, y2 })
    }

    pub fn intersection_area_with(&self, other: &Self) -> T {
        self.intersect_with(other)
            .map(|inter| inter.area())
            .unwrap_or_else(T::zero)
    }

    /// Compute the IoU. Disjoint boxes yield zero without division.
    pub fn iou_with(&self, other: &Self) -> T {
        let inter = self.intersection_area_with(other);
        if inter <= T::zero() {
            return T::zero();
        }
        inter / (self.area() + other.area() - inter)
    }

    /// Clamp the box into `[0, w] x [0, h]`.
    pub fn clip(&self, h: T, w: T) -> Self {
        let clamp = |val: T, upper: T| {
            if val < T::zero() {
                T::zero()
            } else if val > upper {
                upper
            } else {
                val
            }
        };
        Self {
            x1: clamp(self.x1, w),
            y1: clamp(self.y1, h),
            x2: clamp(self.x2, w),
            y2: clamp(self.y2, h),
        }
    }

    /// Corners in counter-clockwise order starting from `(x1, y1)`.
    pub fn corners(&self) -> [[T; 2]; 4] {
        let Self { x1, y1, x2, y2 } = *self;
        [[x1, y1], [x2, y1], [x2, y2], [x1, y2]]
    }

    pub fn to_polygon(&self) -> Polygon<T> {
        Polygon::new(self.corners().to_vec())
    }
}
