use crate::{common::*, size::ImageSize, tensor::TensorExt};

/// Rotated boxes in (cx, cy, w, h, angle) format with shape `[N, 5]`.
///
/// Angles are in degrees and counter-clockwise in image coordinates.
#[derive(Debug, TensorLike, Getters)]
pub struct RotatedBoxes {
    #[get = "pub"]
    pub(crate) tensor: Tensor,
}

impl RotatedBoxes {
    pub const BOX_DIM: i64 = 5;
    pub const DEFAULT_CLIP_ANGLE_THRESHOLD: f64 = 1.0;

    pub fn new(tensor: Tensor) -> Result<Self> {
        let tensor = if tensor.numel() == 0 {
            Tensor::zeros(&[0, 5], (Kind::Float, tensor.device()))
        } else {
            tensor
        };
        match tensor.size().as_slice() {
            &[_, 5] => (),
            shape => bail!("expect a [N, 5] tensor, but get shape {:?}", shape),
        }
        Ok(Self { tensor })
    }

    pub fn empty(device: Device) -> Self {
        Self {
            tensor: Tensor::zeros(&[0, 5], (Kind::Float, device)),
        }
    }

    pub fn from_cxcywha(boxes: &[[f32; 5]]) -> Result<Self> {
        let flat: Vec<f32> = boxes.iter().flatten().cloned().collect();
        Self::new(Tensor::of_slice(&flat).view([-1, 5]))
    }

    pub fn len(&self) -> i64 {
        self.tensor.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device(&self) -> Device {
        self.tensor.device()
    }

    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }

    pub fn cx(&self) -> Tensor {
        self.tensor.select(1, 0)
    }

    pub fn cy(&self) -> Tensor {
        self.tensor.select(1, 1)
    }

    pub fn w(&self) -> Tensor {
        self.tensor.select(1, 2)
    }

    pub fn h(&self) -> Tensor {
        self.tensor.select(1, 3)
    }

    pub fn angle(&self) -> Tensor {
        self.tensor.select(1, 4)
    }

    pub fn area(&self) -> Tensor {
        self.w() * self.h()
    }

    pub fn centers(&self) -> Tensor {
        self.tensor.i((.., 0..2))
    }

    /// Shift every angle into `[-180, 180)`.
    pub fn normalize_angles(&self) -> Self {
        let tensor = Tensor::cat(
            &[
                self.tensor.i((.., 0..4)),
                self.angle().normalize_degrees().unsqueeze(1),
            ],
            1,
        );
        Self { tensor }
    }

    /// Clip the nearly horizontal boxes into the image.
    ///
    /// Only boxes with `|angle| <= clip_angle_threshold` after angle normalization
    /// are touched. They are treated as axis-aligned, clamped, and the width and
    /// height shrink to the clamped extent.
    pub fn clip(&self, image_size: &ImageSize, clip_angle_threshold: f64) -> Result<Self> {
        ensure!(
            self.tensor.all_finite(),
            "box tensor contains infinite or NaN"
        );
        let normalized = self.normalize_angles();
        let h = image_size.h() as f64;
        let w = image_size.w() as f64;

        let cx = normalized.cx();
        let cy = normalized.cy();
        let bw = normalized.w();
        let bh = normalized.h();
        let angle = normalized.angle();

        let x1 = (&cx - &bw / 2.0).clamp(0.0, w);
        let y1 = (&cy - &bh / 2.0).clamp(0.0, h);
        let x2 = (&cx + &bw / 2.0).clamp(0.0, w);
        let y2 = (&cy + &bh / 2.0).clamp(0.0, h);

        let clipped_cx = (&x1 + &x2) / 2.0;
        let clipped_cy = (&y1 + &y2) / 2.0;
        let clipped_w = bw.minimum(&(&x2 - &x1));
        let clipped_h = bh.minimum(&(&y2 - &y1));

        let mask = angle.abs().le(clip_angle_threshold);
        let tensor = Tensor::stack(
            &[
                clipped_cx.where_self(&mask, &cx),
                clipped_cy.where_self(&mask, &cy),
                clipped_w.where_self(&mask, &bw),
                clipped_h.where_self(&mask, &bh),
                angle,
            ],
            1,
        );
        Ok(Self { tensor })
    }

    pub fn nonempty(&self, threshold: f64) -> Tensor {
        self.w().gt(threshold).logical_and(&self.h().gt(threshold))
    }

    /// Whether the rotated extent lies inside the image with `boundary_threshold` slack.
    ///
    /// Edges are inclusive, so boxes produced by [RotatedBoxes::clip] stay inside.
    pub fn inside_box(&self, image_size: &ImageSize, boundary_threshold: i64) -> Tensor {
        let h = image_size.h() as f64;
        let w = image_size.w() as f64;
        let b = boundary_threshold as f64;

        let cx = self.cx();
        let cy = self.cy();
        let half_w = self.w() / 2.0;
        let half_h = self.h() / 2.0;
        let theta = self.angle() * PI / 180.0;
        let c = theta.cos().abs();
        let s = theta.sin().abs();

        let dx = &c * &half_w + &s * &half_h;
        let dy = &c * &half_h + &s * &half_w;

        (&cx - &dx)
            .ge(-b)
            .logical_and(&(&cy - &dy).ge(-b))
            .logical_and(&(&cx + &dx).le(w + b))
            .logical_and(&(&cy + &dy).le(h + b))
    }

    /// Scale by `scale_x` horizontally and `scale_y` vertically.
    ///
    /// The result is the rotated box fitted to the scaled rectangle, which is
    /// exact when the scales are equal.
    pub fn scale(&self, scale_x: f64, scale_y: f64) -> Self {
        let theta = self.angle() * PI / 180.0;
        let c = theta.cos();
        let s = theta.sin();

        let cx = self.cx() * scale_x;
        let cy = self.cy() * scale_y;
        let w = self.w() * ((&c * scale_x).square() + (&s * scale_y).square()).sqrt();
        let h = self.h() * ((&s * scale_x).square() + (&c * scale_y).square()).sqrt();
        let angle = (&s * scale_x).atan2(&(&c * scale_y)) * 180.0 / PI;

        Self {
            tensor: Tensor::stack(&[cx, cy, w, h, angle], 1),
        }
    }

    pub fn f_index(&self, index: &Tensor) -> Result<Self> {
        Ok(Self {
            tensor: self.tensor.f_select_rows(index)?,
        })
    }

    pub fn slice(&self, range: Range<i64>) -> Self {
        Self {
            tensor: self.tensor.i(range),
        }
    }

    pub fn cat<B>(boxes: &[B]) -> Result<Self>
    where
        B: Borrow<RotatedBoxes>,
    {
        let tensors: Vec<_> = boxes.iter().map(|b| b.borrow().tensor()).collect();
        let tensor = Tensor::f_cat_or(&tensors, || {
            Tensor::zeros(&[0, 5], (Kind::Float, Device::Cpu))
        })?;
        Self::new(tensor)
    }

    /// Scalar copies of the boxes, on the host.
    pub fn to_rects(&self) -> Vec<RotatedRect<f64>> {
        let flat = Vec::<f64>::from(
            &self
                .tensor
                .to_kind(Kind::Double)
                .contiguous()
                .view([-1]),
        );
        flat.chunks(5)
            .map(|c| RotatedRect::from_cxcywha([c[0], c[1], c[2].max(0.0), c[3].max(0.0), c[4]]))
            .collect()
    }

    /// IoU between every pair of rotated boxes, shape `[N, M]`.
    ///
    /// The polygon intersection runs on the host in double precision.
    pub fn pairwise_iou(lhs: &Self, rhs: &Self) -> Tensor {
        let n = lhs.len();
        let m = rhs.len();
        let kind = lhs.tensor.kind();
        let device = lhs.device();

        let lhs_rects = lhs.to_rects();
        let rhs_rects = rhs.to_rects();
        let values: Vec<f32> = lhs_rects
            .iter()
            .cartesian_product(rhs_rects.iter())
            .map(|(l, r)| l.iou_with(r) as f32)
            .collect();

        Tensor::of_slice(&values)
            .view([n, m])
            .to_kind(kind)
            .to_device(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size::ImageSizeExt;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rotated_boxes_shape() -> Result<()> {
        let boxes = RotatedBoxes::new(Tensor::zeros(&[0], (Kind::Float, Device::Cpu)))?;
        assert_eq!(boxes.tensor().size(), vec![0, 5]);
        assert!(RotatedBoxes::new(Tensor::zeros(&[2, 4], (Kind::Float, Device::Cpu))).is_err());
        Ok(())
    }

    #[test]
    fn rotated_pairwise_iou() -> Result<()> {
        let lhs = RotatedBoxes::from_cxcywha(&[[5.0, 5.0, 10.0, 10.0, 0.0], [0.0, 0.0, 4.0, 2.0, 0.0]])?;
        let rhs = RotatedBoxes::from_cxcywha(&[
            [10.0, 5.0, 10.0, 10.0, 0.0],
            [0.0, 0.0, 4.0, 2.0, 90.0],
        ])?;
        let iou = RotatedBoxes::pairwise_iou(&lhs, &rhs);
        assert_eq!(iou.size(), vec![2, 2]);
        assert_abs_diff_eq!(iou.double_value(&[0, 0]), 1.0 / 3.0, epsilon = 1e-5);
        assert_abs_diff_eq!(iou.double_value(&[1, 1]), 1.0 / 3.0, epsilon = 1e-5);

        let empty = RotatedBoxes::empty(Device::Cpu);
        assert_eq!(RotatedBoxes::pairwise_iou(&empty, &rhs).size(), vec![0, 2]);
        Ok(())
    }

    #[test]
    fn rotated_clip_only_near_horizontal() -> Result<()> {
        let boxes = RotatedBoxes::from_cxcywha(&[
            [2.0, 5.0, 10.0, 4.0, 0.5],
            [2.0, 5.0, 10.0, 4.0, 45.0],
            [2.0, 5.0, 10.0, 4.0, 360.0],
        ])?;
        let size = ImageSize::new_size(10, 20)?;
        let clipped = boxes.clip(&size, 1.0)?;

        let row = Vec::<f32>::from(&clipped.tensor().i(0));
        assert_abs_diff_eq!(row[0] as f64, 3.5, epsilon = 1e-5);
        assert_abs_diff_eq!(row[2] as f64, 7.0, epsilon = 1e-5);
        assert_abs_diff_eq!(row[3] as f64, 4.0, epsilon = 1e-5);

        let row = Vec::<f32>::from(&clipped.tensor().i(1));
        assert_eq!(row, vec![2.0, 5.0, 10.0, 4.0, 45.0]);

        // 360 degrees normalizes to 0 and is clipped as well
        let row = Vec::<f32>::from(&clipped.tensor().i(2));
        assert_abs_diff_eq!(row[0] as f64, 3.5, epsilon = 1e-5);
        assert_abs_diff_eq!(row[4] as f64, 0.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn rotated_clip_keeps_boxes_inside() -> Result<()> {
        let boxes = RotatedBoxes::from_cxcywha(&[
            [-1.0, 5.0, 6.0, 4.0, 0.0],
            [19.0, 5.0, 6.0, 4.0, 0.0],
            [10.0, -1.0, 4.0, 6.0, 0.0],
            [10.0, 11.0, 4.0, 6.0, 0.0],
            [30.0, 5.0, 4.0, 4.0, 0.0],
            [-10.0, -10.0, 4.0, 4.0, 0.0],
            [10.0, 5.0, 30.0, 16.0, 0.0],
        ])?;
        let size = ImageSize::new_size(10, 20)?;
        let clipped = boxes.clip(&size, 1.0)?;

        let rows: Vec<Vec<f32>> = (0..clipped.len())
            .map(|index| Vec::<f32>::from(&clipped.tensor().i(index)))
            .collect();
        for row in &rows {
            let [cx, cy, w, h] = [row[0], row[1], row[2], row[3]];
            assert!(w >= 0.0 && h >= 0.0);
            assert!(cx - w / 2.0 >= -1e-5 && cx + w / 2.0 <= 20.0 + 1e-5);
            assert!(cy - h / 2.0 >= -1e-5 && cy + h / 2.0 <= 10.0 + 1e-5);
        }

        assert_eq!(rows[0][..4], [1.0, 5.0, 2.0, 4.0]);
        assert_eq!(rows[1][..4], [18.0, 5.0, 4.0, 4.0]);
        assert_eq!(rows[2][..4], [10.0, 1.0, 4.0, 2.0]);
        assert_eq!(rows[3][..4], [10.0, 9.0, 4.0, 2.0]);
        // boxes entirely outside collapse onto the nearest image edge
        assert_eq!(rows[4][..4], [20.0, 5.0, 0.0, 4.0]);
        assert_eq!(rows[5][..4], [0.0, 0.0, 0.0, 0.0]);
        assert_eq!(rows[6][..4], [10.0, 5.0, 20.0, 10.0]);

        let nonempty = Vec::<bool>::from(&clipped.nonempty(0.0));
        let inside = Vec::<bool>::from(&clipped.inside_box(&size, 0));
        assert_eq!(nonempty, vec![true, true, true, true, false, false, true]);
        izip!(nonempty, inside).for_each(|(nonempty, inside)| assert!(!nonempty || inside));
        Ok(())
    }

    #[test]
    fn rotated_scale_uniform() -> Result<()> {
        let boxes = RotatedBoxes::from_cxcywha(&[[4.0, 2.0, 6.0, 3.0, 30.0]])?;
        let scaled = boxes.scale(2.0, 2.0);
        let row = Vec::<f32>::from(&scaled.tensor().i(0));
        let expect = [8.0, 4.0, 12.0, 6.0, 30.0];
        row.iter().zip(expect.iter()).for_each(|(&lhs, &rhs)| {
            assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-4);
        });
        Ok(())
    }

    #[test]
    fn rotated_inside_box() -> Result<()> {
        let boxes = RotatedBoxes::from_cxcywha(&[
            [10.0, 9.0, 4.0, 4.0, 0.0],
            [10.0, 10.0, 4.0, 4.0, 45.0],
        ])?;
        let size = ImageSize::new_size(12, 20)?;
        let inside = Vec::<bool>::from(&boxes.inside_box(&size, 0));
        // the diagonal of the rotated square reaches past y = 12
        assert_eq!(inside, vec![true, false]);
        Ok(())
    }
}
