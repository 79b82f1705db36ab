use crate::common::*;

/// Per-instance keypoints with shape `[N, K, 3]` in (x, y, visibility) order.
#[derive(Debug, TensorLike, Getters)]
pub struct Keypoints {
    #[get = "pub"]
    tensor: Tensor,
}

impl Keypoints {
    pub fn new(tensor: Tensor) -> Result<Self> {
        match tensor.size().as_slice() {
            &[_, _, 3] => (),
            shape => bail!("expect a [N, K, 3] keypoint tensor, but get {:?}", shape),
        }
        Ok(Self { tensor })
    }

    pub fn len(&self) -> i64 {
        self.tensor.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_keypoints(&self) -> i64 {
        self.tensor.size()[1]
    }

    pub fn slice(&self, range: Range<i64>) -> Self {
        Self {
            tensor: self.tensor.i(range),
        }
    }

    pub fn f_index(&self, index: &Tensor) -> Result<Self> {
        Ok(Self {
            tensor: self.tensor.f_select_rows(index)?,
        })
    }

    pub fn cat<K>(keypoints: &[K]) -> Result<Self>
    where
        K: Borrow<Keypoints>,
    {
        let tensors: Vec<_> = keypoints.iter().map(|k| k.borrow().tensor()).collect();
        ensure!(
            !tensors.is_empty(),
            "cannot concatenate an empty list of keypoints"
        );
        Self::new(Tensor::f_cat(&tensors, 0)?)
    }

    /// Encode keypoints into flat heatmap indices within `boxes`.
    ///
    /// Returns `(heatmaps, valid)`, both `[N, K]` int64. A keypoint is valid if it
    /// is visible and falls inside its box. Points lying exactly on the right or
    /// bottom edge map to the last cell.
    pub fn to_heatmap(&self, boxes: &Tensor, heatmap_size: i64) -> Result<(Tensor, Tensor)> {
        ensure!(
            boxes.size() == vec![self.len(), 4],
            "expect [{}, 4] boxes, but get {:?}",
            self.len(),
            boxes.size()
        );
        let device = self.tensor.device();
        if boxes.numel() == 0 {
            let empty = Tensor::zeros(&[0, self.num_keypoints()], (Kind::Int64, device));
            return Ok((empty.shallow_clone(), empty));
        }

        let offset_x = boxes.i((.., 0..1));
        let offset_y = boxes.i((.., 1..2));
        let right = boxes.i((.., 2..3));
        let bottom = boxes.i((.., 3..4));
        let scale_x = (&right - &offset_x).reciprocal() * heatmap_size as f64;
        let scale_y = (&bottom - &offset_y).reciprocal() * heatmap_size as f64;

        let x = self.tensor.select(2, 0);
        let y = self.tensor.select(2, 1);
        let x_boundary = x.eq_tensor(&right);
        let y_boundary = y.eq_tensor(&bottom);

        let last = Tensor::from(heatmap_size - 1).to_device(device);
        let x = ((&x - &offset_x) * &scale_x)
            .floor()
            .to_kind(Kind::Int64)
            .where_self(&x_boundary.logical_not(), &last);
        let y = ((&y - &offset_y) * &scale_y)
            .floor()
            .to_kind(Kind::Int64)
            .where_self(&y_boundary.logical_not(), &last);

        let valid_loc = x
            .ge(0i64)
            .logical_and(&y.ge(0i64))
            .logical_and(&x.lt(heatmap_size))
            .logical_and(&y.lt(heatmap_size));
        let visible = self.tensor.select(2, 2).gt(0.0);
        let valid = valid_loc.logical_and(&visible).to_kind(Kind::Int64);

        let heatmaps = (y * heatmap_size + x) * &valid;
        Ok((heatmaps, valid))
    }
}

/// Decode predicted heatmap logits `[R, K, H, W]` into keypoints within `boxes` `[R, 4]`.
///
/// Each map is bicubically resized to the ceiled box size before taking the
/// argmax. Returns `[R, K, 4]` rows of (x, y, logit, score) where the score is
/// the softmax probability normalized over the low resolution map.
pub fn heatmaps_to_keypoints(maps: &Tensor, boxes: &Tensor) -> Result<Tensor> {
    let (num_rois, num_keypoints, _, _) = maps.size4()?;
    ensure!(
        boxes.size() == vec![num_rois, 4],
        "expect [{}, 4] boxes, but get {:?}",
        num_rois,
        boxes.size()
    );
    let device = maps.device();
    if num_rois == 0 {
        return Ok(Tensor::zeros(
            &[0, num_keypoints, 4],
            (Kind::Float, device),
        ));
    }

    let maps = maps.detach().to_kind(Kind::Float);
    let boxes = boxes.detach().to_kind(Kind::Float);
    let offset_x = boxes.select(1, 0);
    let offset_y = boxes.select(1, 1);
    let widths = (boxes.select(1, 2) - &offset_x).clamp_min(1.0);
    let heights = (boxes.select(1, 3) - &offset_y).clamp_min(1.0);
    let widths_ceil = widths.ceil();
    let heights_ceil = heights.ceil();
    let width_corrections = &widths / &widths_ceil;
    let height_corrections = &heights / &heights_ceil;

    let keypoint_idx = Tensor::arange(num_keypoints, (Kind::Int64, device));

    let rows: Vec<_> = (0..num_rois)
        .map(|i| {
            let out_h = heights_ceil.double_value(&[i]) as i64;
            let out_w = widths_ceil.double_value(&[i]) as i64;
            let roi_map = maps
                .i(i..i + 1)
                .upsample_bicubic2d(&[out_h, out_w], false, None, None)
                .squeeze_dim(0);

            let flat = roi_map.view([num_keypoints, -1]);
            let max_score = flat.max_dim(1, false).0.view([num_keypoints, 1, 1]);
            let full_resolution = (&roi_map - &max_score).exp();
            let pool_resolution = (maps.get(i) - &max_score).exp();
            let scores = full_resolution
                / pool_resolution.sum_dim_intlist(&[1, 2], true, Kind::Float);

            let pos = flat.argmax(1, false);
            let x_int = pos.remainder(out_w);
            let y_int = ((&pos - &x_int) / out_w).to_kind(Kind::Int64);

            let x = (x_int.to_kind(Kind::Float) + 0.5) * width_corrections.get(i)
                + offset_x.get(i);
            let y = (y_int.to_kind(Kind::Float) + 0.5) * height_corrections.get(i)
                + offset_y.get(i);
            let index = [Some(&keypoint_idx), Some(&y_int), Some(&x_int)];
            let logit = roi_map.index(&index);
            let score = scores.index(&index);

            Tensor::stack(&[x, y, logit, score], 1)
        })
        .collect();

    Ok(Tensor::stack(&rows, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypoints_to_heatmap() -> Result<()> {
        let keypoints = Keypoints::new(
            Tensor::of_slice(&[
                5.0f32, 5.0, 2.0, //
                8.0, 8.0, 2.0, //
                -1.0, 5.0, 2.0, //
                5.0, 5.0, 0.0,
            ])
            .view([1, 4, 3]),
        )?;
        let boxes = Tensor::of_slice(&[0.0f32, 0.0, 8.0, 8.0]).view([1, 4]);
        let (heatmaps, valid) = keypoints.to_heatmap(&boxes, 56)?;

        assert_eq!(Vec::<i64>::from(&valid.view([-1])), vec![1, 1, 0, 0]);
        // the bottom right corner maps to the last cell
        assert_eq!(
            Vec::<i64>::from(&heatmaps.view([-1])),
            vec![35 * 56 + 35, 55 * 56 + 55, 0, 0]
        );
        Ok(())
    }

    #[test]
    fn keypoints_to_heatmap_empty() -> Result<()> {
        let keypoints = Keypoints::new(Tensor::zeros(&[0, 17, 3], (Kind::Float, Device::Cpu)))?;
        let boxes = Tensor::zeros(&[0, 4], (Kind::Float, Device::Cpu));
        let (heatmaps, valid) = keypoints.to_heatmap(&boxes, 56)?;
        assert_eq!(heatmaps.size(), vec![0, 17]);
        assert_eq!(valid.size(), vec![0, 17]);
        Ok(())
    }

    #[test]
    fn decode_heatmap_peak() -> Result<()> {
        // a single sharp peak at cell (row 1, col 2) of a 4x4 map
        let mut maps = Tensor::full(&[1, 1, 4, 4], -10.0, (Kind::Float, Device::Cpu));
        let _ = maps.i((0, 0, 1, 2)).fill_(10.0);
        let boxes = Tensor::of_slice(&[100.0f32, 200.0, 104.0, 204.0]).view([1, 4]);
        let keypoints = heatmaps_to_keypoints(&maps, &boxes)?;
        assert_eq!(keypoints.size(), vec![1, 1, 4]);

        let row = Vec::<f32>::from(&keypoints.view([-1]));
        assert_abs_diff_eq!(row[0], 102.5, epsilon = 1e-4);
        assert_abs_diff_eq!(row[1], 201.5, epsilon = 1e-4);
        assert_abs_diff_eq!(row[2], 10.0, epsilon = 1e-3);
        assert!(row[3] > 0.99);

        maps = maps.zeros_like();
        let flat = heatmaps_to_keypoints(&maps, &boxes)?;
        assert_abs_diff_eq!(flat.double_value(&[0, 0, 3]), 1.0 / 16.0, epsilon = 1e-5);
        Ok(())
    }
}
