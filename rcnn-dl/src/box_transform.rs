//! Box regression deltas between proposals and targets.

use crate::common::*;

/// Upper bound of width and height deltas before exponentiation.
pub fn default_scale_clamp() -> f64 {
    (1000.0f64 / 16.0).ln()
}

/// Deltas of axis-aligned boxes, `(dx, dy, dw, dh)` scaled by `weights`.
#[derive(Debug, Clone, PartialEq)]
pub struct Box2BoxTransform {
    weights: [f64; 4],
    scale_clamp: f64,
}

impl Box2BoxTransform {
    pub fn new(weights: [f64; 4], scale_clamp: f64) -> Self {
        Self {
            weights,
            scale_clamp,
        }
    }

    pub fn weights(&self) -> [f64; 4] {
        self.weights
    }

    /// Compute `[N, 4]` deltas transforming `src` boxes into `target` boxes.
    pub fn get_deltas(&self, src: &Tensor, target: &Tensor) -> Result<Tensor> {
        check_pair(src, target, 4)?;
        let [wx, wy, ww, wh] = self.weights;

        let src_widths = src.select(1, 2) - src.select(1, 0);
        let src_heights = src.select(1, 3) - src.select(1, 1);
        ensure!(
            bool::from(src_widths.gt(0.0).all()),
            "source boxes must have positive widths"
        );
        let src_ctr_x = src.select(1, 0) + &src_widths * 0.5;
        let src_ctr_y = src.select(1, 1) + &src_heights * 0.5;

        let target_widths = target.select(1, 2) - target.select(1, 0);
        let target_heights = target.select(1, 3) - target.select(1, 1);
        let target_ctr_x = target.select(1, 0) + &target_widths * 0.5;
        let target_ctr_y = target.select(1, 1) + &target_heights * 0.5;

        let dx = (target_ctr_x - src_ctr_x) / &src_widths * wx;
        let dy = (target_ctr_y - src_ctr_y) / &src_heights * wy;
        let dw = (target_widths / &src_widths).log() * ww;
        let dh = (target_heights / &src_heights).log() * wh;

        Ok(Tensor::stack(&[dx, dy, dw, dh], 1))
    }

    /// Apply `[N, K * 4]` deltas to `[N, 4]` boxes, yielding `[N, K * 4]` boxes.
    ///
    /// Class-specific deltas broadcast against a single box per row.
    pub fn apply_deltas(&self, deltas: &Tensor, boxes: &Tensor) -> Result<Tensor> {
        let (num_boxes, num_classes) = check_deltas(deltas, boxes, 4)?;
        let [wx, wy, ww, wh] = self.weights;
        let deltas = deltas.to_kind(Kind::Float);
        let boxes = boxes.to_kind(Kind::Float);

        let widths = (boxes.select(1, 2) - boxes.select(1, 0)).unsqueeze(1);
        let heights = (boxes.select(1, 3) - boxes.select(1, 1)).unsqueeze(1);
        let ctr_x = boxes.select(1, 0).unsqueeze(1) + &widths * 0.5;
        let ctr_y = boxes.select(1, 1).unsqueeze(1) + &heights * 0.5;

        let per_class = deltas.view([num_boxes, num_classes, 4]);
        let dx = per_class.select(2, 0) / wx;
        let dy = per_class.select(2, 1) / wy;
        let dw = (per_class.select(2, 2) / ww).clamp_max(self.scale_clamp);
        let dh = (per_class.select(2, 3) / wh).clamp_max(self.scale_clamp);

        let pred_ctr_x = dx * &widths + ctr_x;
        let pred_ctr_y = dy * &heights + ctr_y;
        let pred_w = dw.exp() * &widths;
        let pred_h = dh.exp() * &heights;

        let pred = Tensor::stack(
            &[
                &pred_ctr_x - &pred_w * 0.5,
                &pred_ctr_y - &pred_h * 0.5,
                &pred_ctr_x + &pred_w * 0.5,
                &pred_ctr_y + &pred_h * 0.5,
            ],
            2,
        );
        Ok(pred.view([num_boxes, num_classes * 4]))
    }
}

/// Deltas of rotated boxes, `(dx, dy, dw, dh, da)` scaled by `weights`.
///
/// Box angles are in degrees while angle deltas are in radians.
#[derive(Debug, Clone, PartialEq)]
pub struct Box2BoxTransformRotated {
    weights: [f64; 5],
    scale_clamp: f64,
}

impl Box2BoxTransformRotated {
    pub fn new(weights: [f64; 5], scale_clamp: f64) -> Self {
        Self {
            weights,
            scale_clamp,
        }
    }

    pub fn weights(&self) -> [f64; 5] {
        self.weights
    }

    pub fn get_deltas(&self, src: &Tensor, target: &Tensor) -> Result<Tensor> {
        check_pair(src, target, 5)?;
        let [wx, wy, ww, wh, wa] = self.weights;

        let src_widths = src.select(1, 2);
        let src_heights = src.select(1, 3);
        ensure!(
            bool::from(src_widths.gt(0.0).all()),
            "source boxes must have positive widths"
        );

        let dx = (target.select(1, 0) - src.select(1, 0)) / &src_widths * wx;
        let dy = (target.select(1, 1) - src.select(1, 1)) / &src_heights * wy;
        let dw = (target.select(1, 2) / &src_widths).log() * ww;
        let dh = (target.select(1, 3) / &src_heights).log() * wh;
        let da = (target.select(1, 4) - src.select(1, 4)).normalize_degrees() * (wa * PI / 180.0);

        Ok(Tensor::stack(&[dx, dy, dw, dh, da], 1))
    }

    /// Apply `[N, K * 5]` deltas to `[N, 5]` boxes, yielding `[N, K * 5]` boxes.
    pub fn apply_deltas(&self, deltas: &Tensor, boxes: &Tensor) -> Result<Tensor> {
        let (num_boxes, num_classes) = check_deltas(deltas, boxes, 5)?;
        let [wx, wy, ww, wh, wa] = self.weights;
        let deltas = deltas.to_kind(Kind::Float);
        let boxes = boxes.to_kind(Kind::Float);

        let ctr_x = boxes.select(1, 0).unsqueeze(1);
        let ctr_y = boxes.select(1, 1).unsqueeze(1);
        let widths = boxes.select(1, 2).unsqueeze(1);
        let heights = boxes.select(1, 3).unsqueeze(1);
        let angles = boxes.select(1, 4).unsqueeze(1);

        let per_class = deltas.view([num_boxes, num_classes, 5]);
        let dx = per_class.select(2, 0) / wx;
        let dy = per_class.select(2, 1) / wy;
        let dw = (per_class.select(2, 2) / ww).clamp_max(self.scale_clamp);
        let dh = (per_class.select(2, 3) / wh).clamp_max(self.scale_clamp);
        let da = per_class.select(2, 4) / wa;

        let pred_angle = (da * (180.0 / PI) + angles).normalize_degrees();
        let pred = Tensor::stack(
            &[
                dx * &widths + ctr_x,
                dy * &heights + ctr_y,
                dw.exp() * &widths,
                dh.exp() * &heights,
                pred_angle,
            ],
            2,
        );
        Ok(pred.view([num_boxes, num_classes * 5]))
    }
}

/// Either box transform, chosen by the number of weights.
#[derive(Debug, Clone, PartialEq)]
pub enum BoxTransform {
    Boxes(Box2BoxTransform),
    Rotated(Box2BoxTransformRotated),
}

impl BoxTransform {
    /// Build from 4 weights for axis-aligned boxes or 5 weights for rotated boxes.
    pub fn new(weights: &[R64], scale_clamp: f64) -> Result<Self> {
        let transform = match *weights {
            [wx, wy, ww, wh] => Self::Boxes(Box2BoxTransform::new(
                [wx.raw(), wy.raw(), ww.raw(), wh.raw()],
                scale_clamp,
            )),
            [wx, wy, ww, wh, wa] => Self::Rotated(Box2BoxTransformRotated::new(
                [wx.raw(), wy.raw(), ww.raw(), wh.raw(), wa.raw()],
                scale_clamp,
            )),
            _ => bail!(
                "expect 4 or 5 box regression weights, but get {}",
                weights.len()
            ),
        };
        Ok(transform)
    }

    pub fn box_dim(&self) -> i64 {
        match self {
            Self::Boxes(_) => 4,
            Self::Rotated(_) => 5,
        }
    }

    pub fn get_deltas(&self, src: &Tensor, target: &Tensor) -> Result<Tensor> {
        match self {
            Self::Boxes(transform) => transform.get_deltas(src, target),
            Self::Rotated(transform) => transform.get_deltas(src, target),
        }
    }

    pub fn apply_deltas(&self, deltas: &Tensor, boxes: &Tensor) -> Result<Tensor> {
        match self {
            Self::Boxes(transform) => transform.apply_deltas(deltas, boxes),
            Self::Rotated(transform) => transform.apply_deltas(deltas, boxes),
        }
    }
}

fn check_pair(src: &Tensor, target: &Tensor, box_dim: i64) -> Result<()> {
    let (num_src, src_dim) = src.size2()?;
    let (num_target, target_dim) = target.size2()?;
    ensure!(
        src_dim == box_dim && target_dim == box_dim,
        "expect boxes with {} columns, but get {} and {}",
        box_dim,
        src_dim,
        target_dim
    );
    ensure!(
        num_src == num_target,
        "source and target box counts differ, {} vs {}",
        num_src,
        num_target
    );
    Ok(())
}

fn check_deltas(deltas: &Tensor, boxes: &Tensor, box_dim: i64) -> Result<(i64, i64)> {
    let (num_deltas, delta_dim) = deltas.size2()?;
    let (num_boxes, dim) = boxes.size2()?;
    ensure!(dim == box_dim, "expect boxes with {} columns, but get {}", box_dim, dim);
    ensure!(
        num_deltas == num_boxes,
        "delta and box counts differ, {} vs {}",
        num_deltas,
        num_boxes
    );
    ensure!(
        delta_dim % box_dim == 0 && delta_dim > 0,
        "the delta width {} is not a multiple of {}",
        delta_dim,
        box_dim
    );
    Ok((num_boxes, delta_dim / box_dim))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(lhs: &Tensor, rhs: &Tensor, epsilon: f64) {
        assert_eq!(lhs.size(), rhs.size());
        let diff = f64::from((lhs - rhs).abs().max());
        assert!(diff <= epsilon, "max difference {} exceeds {}", diff, epsilon);
    }

    #[test]
    fn axis_aligned_round_trip() -> Result<()> {
        let transform = Box2BoxTransform::new([10.0, 10.0, 5.0, 5.0], default_scale_clamp());
        let src = Tensor::of_slice(&[0.0f32, 0.0, 10.0, 20.0, 5.0, 5.0, 7.0, 9.0]).view([2, 4]);
        let target =
            Tensor::of_slice(&[2.0f32, -1.0, 14.0, 18.0, 4.0, 6.0, 9.0, 8.0]).view([2, 4]);

        let deltas = transform.get_deltas(&src, &target)?;
        assert_abs_diff_eq!(deltas.double_value(&[0, 0]), 10.0 * 3.0 / 10.0, epsilon = 1e-5);
        let restored = transform.apply_deltas(&deltas, &src)?;
        assert_close(&restored, &target, 1e-4);
        Ok(())
    }

    #[test]
    fn class_specific_deltas_broadcast() -> Result<()> {
        let transform = Box2BoxTransform::new([1.0; 4], default_scale_clamp());
        let boxes = Tensor::of_slice(&[0.0f32, 0.0, 4.0, 4.0]).view([1, 4]);
        let deltas = Tensor::of_slice(&[0.0f32, 0.0, 0.0, 0.0, 0.5, 0.0, 0.0, 0.0]).view([1, 8]);
        let pred = transform.apply_deltas(&deltas, &boxes)?;
        let expect =
            Tensor::of_slice(&[0.0f32, 0.0, 4.0, 4.0, 2.0, 0.0, 6.0, 4.0]).view([1, 8]);
        assert_close(&pred, &expect, 1e-6);
        assert!(transform.apply_deltas(&deltas.i((.., 0..6)), &boxes).is_err());
        Ok(())
    }

    #[test]
    fn scale_clamp_saturates() -> Result<()> {
        let transform = Box2BoxTransform::new([1.0; 4], default_scale_clamp());
        let boxes = Tensor::of_slice(&[0.0f32, 0.0, 16.0, 16.0]).view([1, 4]);
        let deltas = Tensor::of_slice(&[0.0f32, 0.0, 100.0, 100.0]).view([1, 4]);
        let pred = transform.apply_deltas(&deltas, &boxes)?;
        let width = pred.double_value(&[0, 2]) - pred.double_value(&[0, 0]);
        assert_abs_diff_eq!(width, 1000.0, epsilon = 1e-2);
        Ok(())
    }

    #[test]
    fn invalid_source_boxes() {
        let transform = Box2BoxTransform::new([1.0; 4], default_scale_clamp());
        let src = Tensor::of_slice(&[3.0f32, 0.0, 3.0, 5.0]).view([1, 4]);
        assert!(transform.get_deltas(&src, &src).is_err());
    }

    #[test]
    fn rotated_round_trip() -> Result<()> {
        let transform =
            Box2BoxTransformRotated::new([10.0, 10.0, 5.0, 5.0, 1.0], default_scale_clamp());
        let src = Tensor::of_slice(&[10.0f32, 10.0, 4.0, 6.0, 170.0]).view([1, 5]);
        let target = Tensor::of_slice(&[12.0f32, 9.0, 5.0, 3.0, -170.0]).view([1, 5]);

        let deltas = transform.get_deltas(&src, &target)?;
        let restored = transform.apply_deltas(&deltas, &src)?;
        assert_close(&restored, &target, 1e-3);
        Ok(())
    }

    #[test]
    fn rotated_angle_delta_is_in_radians() -> Result<()> {
        // box angles are degrees, the angle delta is the wrapped difference in radians
        let transform = Box2BoxTransformRotated::new([1.0; 5], default_scale_clamp());
        let src = Tensor::of_slice(&[0.0f32, 0.0, 2.0, 2.0, 170.0]).view([1, 5]);
        let target = Tensor::of_slice(&[0.0f32, 0.0, 2.0, 2.0, -100.0]).view([1, 5]);
        let deltas = transform.get_deltas(&src, &target)?;
        assert_abs_diff_eq!(deltas.double_value(&[0, 4]), PI / 2.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn transform_by_weight_count() -> Result<()> {
        let weights: Vec<_> = [1.0, 1.0, 1.0, 1.0, 1.0].iter().map(|&w| r64(w)).collect();
        assert_eq!(BoxTransform::new(&weights[..4], default_scale_clamp())?.box_dim(), 4);
        assert_eq!(BoxTransform::new(&weights, default_scale_clamp())?.box_dim(), 5);
        assert!(BoxTransform::new(&weights[..3], default_scale_clamp()).is_err());
        Ok(())
    }
}
