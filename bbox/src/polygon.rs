use crate::{common::*, Transform, XYXY};

/// Simple polygon given by its vertices in drawing order.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon<T> {
    points: Vec<[T; 2]>,
}

impl<T> Polygon<T> {
    pub fn new(points: Vec<[T; 2]>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[[T; 2]] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl<T> Polygon<T>
where
    T: Float,
{
    /// Build from a flat `[x0, y0, x1, y1, ...]` coordinate list.
    pub fn try_from_flat(coords: &[T]) -> Result<Self> {
        ensure!(
            coords.len() % 2 == 0,
            "polygon coordinates must come in (x, y) pairs"
        );
        let points = coords.chunks(2).map(|xy| [xy[0], xy[1]]).collect();
        Ok(Self { points })
    }

    /// Shoelace area with sign, positive for counter-clockwise order.
    pub fn signed_area(&self) -> T {
        let n = self.points.len();
        if n < 3 {
            return T::zero();
        }
        let two = T::one() + T::one();
        let sum = (0..n).fold(T::zero(), |acc, i| {
            let [x0, y0] = self.points[i];
            let [x1, y1] = self.points[(i + 1) % n];
            acc + (x0 * y1 - x1 * y0)
        });
        sum / two
    }

    pub fn area(&self) -> T {
        self.signed_area().abs()
    }

    pub fn bounding_box(&self) -> Option<XYXY<T>> {
        let mut iter = self.points.iter();
        let &[x, y] = iter.next()?;
        let (x1, y1, x2, y2) = iter.fold((x, y, x, y), |(x1, y1, x2, y2), &[x, y]| {
            (x1.min(x), y1.min(y), x2.max(x), y2.max(y))
        });
        Some(XYXY { x1, y1, x2, y2 })
    }

    pub fn transform(&self, transform: &Transform<T>) -> Self {
        let points = self.points.iter().map(|&p| transform.apply(p)).collect();
        Self { points }
    }

    /// Even-odd point containment test.
    pub fn contains(&self, x: T, y: T) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let [xi, yi] = self.points[i];
            let [xj, yj] = self.points[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// Clip this polygon by a convex `clipper` (Sutherland-Hodgman).
    ///
    /// The clipper may be in either orientation.
    pub fn clip_by_convex(&self, clipper: &Self) -> Self {
        let n_clip = clipper.points.len();
        if n_clip < 3 || self.points.len() < 3 {
            return Self { points: vec![] };
        }
        let orientation = if clipper.signed_area() >= T::zero() {
            T::one()
        } else {
            -T::one()
        };

        // positive when the point lies left of the directed edge a -> b
        let side = |a: [T; 2], b: [T; 2], p: [T; 2]| {
            ((b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])) * orientation
        };
        let intersect = |a: [T; 2], b: [T; 2], p: [T; 2], q: [T; 2]| {
            let sp = side(a, b, p);
            let sq = side(a, b, q);
            let t = sp / (sp - sq);
            [p[0] + (q[0] - p[0]) * t, p[1] + (q[1] - p[1]) * t]
        };

        let mut output = self.points.clone();
        for i in 0..n_clip {
            if output.is_empty() {
                break;
            }
            let a = clipper.points[i];
            let b = clipper.points[(i + 1) % n_clip];
            let input = std::mem::take(&mut output);
            let n_in = input.len();

            for k in 0..n_in {
                let cur = input[k];
                let prev = input[(k + n_in - 1) % n_in];
                let cur_in = side(a, b, cur) >= T::zero();
                let prev_in = side(a, b, prev) >= T::zero();

                match (prev_in, cur_in) {
                    (true, true) => output.push(cur),
                    (true, false) => output.push(intersect(a, b, prev, cur)),
                    (false, true) => {
                        output.push(intersect(a, b, prev, cur));
                        output.push(cur);
                    }
                    (false, false) => {}
                }
            }
        }

        Self { points: output }
    }

    /// Area of the intersection with another convex polygon.
    pub fn convex_intersection_area(&self, other: &Self) -> T {
        self.clip_by_convex(other).area()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn polygon_area() {
        let square = XYXY::from_xyxy([0.0, 0.0, 2.0, 3.0]).to_polygon();
        assert_abs_diff_eq!(square.area(), 6.0);
        assert!(square.signed_area() > 0.0);

        let triangle = Polygon::try_from_flat(&[0.0, 0.0, 4.0, 0.0, 0.0, 4.0]).unwrap();
        assert_abs_diff_eq!(triangle.area(), 8.0);
    }

    #[test]
    fn polygon_clip() {
        let lhs = XYXY::from_xyxy([0.0, 0.0, 4.0, 4.0]).to_polygon();
        let rhs = XYXY::from_xyxy([2.0, 1.0, 6.0, 3.0]).to_polygon();
        assert_abs_diff_eq!(lhs.convex_intersection_area(&rhs), 4.0, epsilon = 1e-9);

        // a clipper in clockwise order gives the same result
        let cw = Polygon::new(rhs.points().iter().rev().cloned().collect());
        assert_abs_diff_eq!(lhs.convex_intersection_area(&cw), 4.0, epsilon = 1e-9);
    }

    #[test]
    fn polygon_contains() {
        let triangle = Polygon::try_from_flat(&[0.0, 0.0, 4.0, 0.0, 0.0, 4.0]).unwrap();
        assert!(triangle.contains(1.0, 1.0));
        assert!(!triangle.contains(3.0, 3.0));
        assert_eq!(
            triangle.bounding_box().unwrap().xyxy(),
            [0.0, 0.0, 4.0, 4.0]
        );
    }
}
