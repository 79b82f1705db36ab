//! Region feature extraction over `[N, C, H, W]` feature maps.
//!
//! Regions are given as rows `[batch_index, ...box]`. Bilinear sampling
//! goes through `grid_sampler` so gradients flow back into the features.

use crate::common::*;

/// Average bilinear samples in each output bin of axis-aligned regions.
///
/// `rois` is `[R, 5]` with rows `[batch_index, x1, y1, x2, y2]`. When `aligned`
/// is true, box coordinates are shifted by half a pixel so that pixel centers
/// line up with the sampling grid. A `sampling_ratio` of zero picks
/// `ceil(roi_size / output_size)` samples per bin for each region.
pub fn roi_align(
    input: &Tensor,
    rois: &Tensor,
    output_size: (i64, i64),
    spatial_scale: f64,
    sampling_ratio: i64,
    aligned: bool,
) -> Result<Tensor> {
    let (pooled_h, pooled_w) = output_size;
    let rows = check_roi_input(input, rois, 5, output_size)?;
    let (_, channels, _, _) = input.size4()?;
    let offset = if aligned { 0.5 } else { 0.0 };

    let outputs: Vec<_> = rows
        .iter()
        .map(|row| -> Result<Tensor> {
            let batch_index = row[0] as i64;
            let start_w = row[1] * spatial_scale - offset;
            let start_h = row[2] * spatial_scale - offset;
            let end_w = row[3] * spatial_scale - offset;
            let end_h = row[4] * spatial_scale - offset;

            let (roi_w, roi_h) = if aligned {
                (end_w - start_w, end_h - start_h)
            } else {
                ((end_w - start_w).max(1.0), (end_h - start_h).max(1.0))
            };
            let bin_h = roi_h / pooled_h as f64;
            let bin_w = roi_w / pooled_w as f64;
            let grid_h = samples_per_bin(sampling_ratio, roi_h, pooled_h);
            let grid_w = samples_per_bin(sampling_ratio, roi_w, pooled_w);

            let points = SamplingPoints::new(pooled_h * grid_h, pooled_w * grid_w, |iy, ix| {
                let y = start_h + (iy as f64 + 0.5) * bin_h / grid_h as f64;
                let x = start_w + (ix as f64 + 0.5) * bin_w / grid_w as f64;
                (x, y)
            });
            bilinear_bin_average(
                &input.get(batch_index),
                &points,
                (pooled_h, grid_h),
                (pooled_w, grid_w),
            )
        })
        .try_collect()?;

    Ok(stack_or_empty(
        &outputs,
        &[0, channels, pooled_h, pooled_w],
        input,
    ))
}

/// Average bilinear samples in each output bin of rotated regions.
///
/// `rois` is `[R, 6]` with rows `[batch_index, cx, cy, w, h, angle]` and the
/// angle in degrees. Sampling always uses half-pixel aligned coordinates.
pub fn roi_align_rotated(
    input: &Tensor,
    rois: &Tensor,
    output_size: (i64, i64),
    spatial_scale: f64,
    sampling_ratio: i64,
) -> Result<Tensor> {
    let (pooled_h, pooled_w) = output_size;
    let rows = check_roi_input(input, rois, 6, output_size)?;
    let (_, channels, _, _) = input.size4()?;

    let outputs: Vec<_> = rows
        .iter()
        .map(|row| -> Result<Tensor> {
            let batch_index = row[0] as i64;
            let center_w = row[1] * spatial_scale - 0.5;
            let center_h = row[2] * spatial_scale - 0.5;
            let roi_w = (row[3] * spatial_scale).max(1.0);
            let roi_h = (row[4] * spatial_scale).max(1.0);
            let theta = row[5] * PI / 180.0;
            let (sin, cos) = theta.sin_cos();

            let bin_h = roi_h / pooled_h as f64;
            let bin_w = roi_w / pooled_w as f64;
            let grid_h = samples_per_bin(sampling_ratio, roi_h, pooled_h);
            let grid_w = samples_per_bin(sampling_ratio, roi_w, pooled_w);
            let start_h = -roi_h / 2.0;
            let start_w = -roi_w / 2.0;

            let points = SamplingPoints::new(pooled_h * grid_h, pooled_w * grid_w, |iy, ix| {
                let yy = start_h + (iy as f64 + 0.5) * bin_h / grid_h as f64;
                let xx = start_w + (ix as f64 + 0.5) * bin_w / grid_w as f64;
                let x = xx * cos + yy * sin + center_w;
                let y = yy * cos - xx * sin + center_h;
                (x, y)
            });
            bilinear_bin_average(
                &input.get(batch_index),
                &points,
                (pooled_h, grid_h),
                (pooled_w, grid_w),
            )
        })
        .try_collect()?;

    Ok(stack_or_empty(
        &outputs,
        &[0, channels, pooled_h, pooled_w],
        input,
    ))
}

/// Max pooling over quantized bins of axis-aligned regions.
///
/// Box coordinates are rounded to the feature grid. Empty bins produce zeros.
pub fn roi_pool(
    input: &Tensor,
    rois: &Tensor,
    output_size: (i64, i64),
    spatial_scale: f64,
) -> Result<Tensor> {
    let (pooled_h, pooled_w) = output_size;
    let rows = check_roi_input(input, rois, 5, output_size)?;
    let (_, channels, height, width) = input.size4()?;

    let outputs: Vec<_> = rows
        .iter()
        .map(|row| {
            let feature = input.get(row[0] as i64);
            let start_w = (row[1] * spatial_scale).round() as i64;
            let start_h = (row[2] * spatial_scale).round() as i64;
            let end_w = (row[3] * spatial_scale).round() as i64;
            let end_h = (row[4] * spatial_scale).round() as i64;
            let roi_w = (end_w - start_w + 1).max(1);
            let roi_h = (end_h - start_h + 1).max(1);
            let bin_h = roi_h as f64 / pooled_h as f64;
            let bin_w = roi_w as f64 / pooled_w as f64;

            let bins: Vec<_> = (0..pooled_h)
                .cartesian_product(0..pooled_w)
                .map(|(ph, pw)| {
                    let clamp = |val: i64, upper: i64| val.max(0).min(upper);
                    let h0 = clamp((ph as f64 * bin_h).floor() as i64 + start_h, height);
                    let h1 = clamp(((ph + 1) as f64 * bin_h).ceil() as i64 + start_h, height);
                    let w0 = clamp((pw as f64 * bin_w).floor() as i64 + start_w, width);
                    let w1 = clamp(((pw + 1) as f64 * bin_w).ceil() as i64 + start_w, width);

                    if h1 <= h0 || w1 <= w0 {
                        feature.zeros_like().i((.., 0, 0))
                    } else {
                        let (max, _) = feature
                            .i((.., h0..h1, w0..w1))
                            .flatten(1, 2)
                            .max_dim(1, false);
                        max
                    }
                })
                .collect();

            Tensor::stack(&bins, 1).view([channels, pooled_h, pooled_w])
        })
        .collect();

    Ok(stack_or_empty(
        &outputs,
        &[0, channels, pooled_h, pooled_w],
        input,
    ))
}

/// Sampling locations in feature pixel coordinates, row-major over `[h, w]`.
struct SamplingPoints {
    h: i64,
    w: i64,
    xy: Vec<(f64, f64)>,
}

impl SamplingPoints {
    fn new<F>(h: i64, w: i64, f: F) -> Self
    where
        F: Fn(i64, i64) -> (f64, f64),
    {
        let xy = (0..h)
            .cartesian_product(0..w)
            .map(|(iy, ix)| f(iy, ix))
            .collect();
        Self { h, w, xy }
    }
}

fn samples_per_bin(sampling_ratio: i64, roi_size: f64, pooled_size: i64) -> i64 {
    if sampling_ratio > 0 {
        sampling_ratio
    } else {
        (roi_size / pooled_size as f64).ceil().max(1.0) as i64
    }
}

/// Sample `feature` (`[C, H, W]`) bilinearly and average each bin of samples.
///
/// Samples beyond one pixel outside the map contribute zero. Others are
/// clamped to the border before interpolation.
fn bilinear_bin_average(
    feature: &Tensor,
    points: &SamplingPoints,
    (pooled_h, grid_h): (i64, i64),
    (pooled_w, grid_w): (i64, i64),
) -> Result<Tensor> {
    let (channels, height, width) = feature.size3()?;
    let device = feature.device();
    let kind = feature.kind();
    let norm_x = (width - 1).max(1) as f64;
    let norm_y = (height - 1).max(1) as f64;

    let (grid, valid): (Vec<f32>, Vec<f32>) = points
        .xy
        .iter()
        .map(|&(x, y)| {
            let inside =
                y >= -1.0 && y <= height as f64 && x >= -1.0 && x <= width as f64;
            let gx = (x.max(0.0) / norm_x * 2.0 - 1.0) as f32;
            let gy = (y.max(0.0) / norm_y * 2.0 - 1.0) as f32;
            ([gx, gy], if inside { 1.0 } else { 0.0 })
        })
        .fold(
            (vec![], vec![]),
            |(mut grid, mut valid), ([gx, gy], v)| {
                grid.push(gx);
                grid.push(gy);
                valid.push(v);
                (grid, valid)
            },
        );

    let grid = Tensor::of_slice(&grid)
        .view([1, points.h, points.w, 2])
        .to_kind(kind)
        .to_device(device);
    let valid = Tensor::of_slice(&valid)
        .view([1, 1, points.h, points.w])
        .to_kind(kind)
        .to_device(device);

    // bilinear, border padding, corners aligned to pixel centers
    let sampled = feature.unsqueeze(0).f_grid_sampler(&grid, 0, 1, true)? * valid;
    let pooled = sampled
        .view([channels, pooled_h, grid_h, pooled_w, grid_w])
        .mean_dim(&[2, 4], false, kind);
    Ok(pooled)
}

fn check_roi_input(
    input: &Tensor,
    rois: &Tensor,
    roi_dim: i64,
    (pooled_h, pooled_w): (i64, i64),
) -> Result<Vec<Vec<f64>>> {
    let (batch_size, _, _, _) = input.size4()?;
    ensure!(
        pooled_h > 0 && pooled_w > 0,
        "output size must be positive, but get {}x{}",
        pooled_h,
        pooled_w
    );
    match rois.size().as_slice() {
        &[_, d] if d == roi_dim => (),
        shape => bail!("expect [R, {}] rois, but get shape {:?}", roi_dim, shape),
    }

    let flat = Vec::<f64>::from(
        &rois
            .detach()
            .to_kind(Kind::Double)
            .to_device(Device::Cpu)
            .contiguous()
            .view([-1]),
    );
    let rows: Vec<Vec<f64>> = flat.chunks(roi_dim as usize).map(|c| c.to_vec()).collect();
    for row in &rows {
        let batch_index = row[0] as i64;
        ensure!(
            (0..batch_size).contains(&batch_index),
            "batch index {} is out of range for batch size {}",
            batch_index,
            batch_size
        );
    }
    Ok(rows)
}

fn stack_or_empty(outputs: &[Tensor], empty_shape: &[i64], input: &Tensor) -> Tensor {
    if outputs.is_empty() {
        Tensor::zeros(empty_shape, (input.kind(), input.device()))
    } else {
        Tensor::stack(outputs, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ramp(h: i64, w: i64) -> Tensor {
        // value = x + 10 * y
        let xs = Tensor::arange(w, (Kind::Float, Device::Cpu)).view([1, w]);
        let ys = Tensor::arange(h, (Kind::Float, Device::Cpu)).view([h, 1]);
        (xs + ys * 10.0).view([1, 1, h, w])
    }

    #[test]
    fn roi_align_linear_feature() -> Result<()> {
        // bilinear sampling of a linear map reproduces the map at bin centers
        let input = ramp(8, 8);
        let rois = Tensor::of_slice(&[0.0f32, 1.0, 1.0, 5.0, 5.0]).view([1, 5]);
        let output = roi_align(&input, &rois, (2, 2), 1.0, 2, true)?;
        assert_eq!(output.size(), vec![1, 1, 2, 2]);
        // the shifted bins are centered at 1.5 and 3.5 on both axes
        let values = Vec::<f32>::from(&output.view([-1]));
        let expect = [16.5, 18.5, 36.5, 38.5];
        values.iter().zip(expect.iter()).for_each(|(&lhs, &rhs)| {
            assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-4);
        });
        Ok(())
    }

    #[test]
    fn roi_align_out_of_range_is_zero() -> Result<()> {
        let input = Tensor::ones(&[1, 2, 4, 4], (Kind::Float, Device::Cpu));
        let rois = Tensor::of_slice(&[0.0f32, 20.0, 20.0, 30.0, 30.0]).view([1, 5]);
        let output = roi_align(&input, &rois, (3, 3), 1.0, 0, false)?;
        assert_eq!(output.size(), vec![1, 2, 3, 3]);
        assert_abs_diff_eq!(f64::from(output.abs().sum(Kind::Float)), 0.0);

        let empty = roi_align(
            &input,
            &Tensor::zeros(&[0, 5], (Kind::Float, Device::Cpu)),
            (7, 7),
            0.25,
            0,
            true,
        )?;
        assert_eq!(empty.size(), vec![0, 2, 7, 7]);

        let bad = Tensor::of_slice(&[3.0f32, 0.0, 0.0, 1.0, 1.0]).view([1, 5]);
        assert!(roi_align(&input, &bad, (2, 2), 1.0, 0, true).is_err());
        Ok(())
    }

    #[test]
    fn roi_align_rotated_zero_angle_matches_aligned() -> Result<()> {
        let input = ramp(10, 12);
        let rois = Tensor::of_slice(&[0.0f32, 2.0, 1.0, 8.0, 7.0]).view([1, 5]);
        let rotated = Tensor::of_slice(&[0.0f32, 5.0, 4.0, 6.0, 6.0, 0.0]).view([1, 6]);
        let lhs = roi_align(&input, &rois, (3, 3), 1.0, 2, true)?;
        let rhs = roi_align_rotated(&input, &rotated, (3, 3), 1.0, 2)?;
        assert_abs_diff_eq!(f64::from((lhs - rhs).abs().max()), 0.0, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn roi_align_rotated_quarter_turn() -> Result<()> {
        // rotating by 90 degrees swaps the roles of the axes
        let input = ramp(10, 10);
        let rois = Tensor::of_slice(&[0.0f32, 5.0, 5.0, 4.0, 4.0, 90.0]).view([1, 6]);
        let output = roi_align_rotated(&input, &rois, (1, 2), 1.0, 1)?;
        let values = Vec::<f32>::from(&output.view([-1]));
        // the two bins differ along y instead of x
        assert_abs_diff_eq!(values[0], 59.5, epsilon = 1e-3);
        assert_abs_diff_eq!(values[1], 39.5, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn roi_pool_takes_bin_max() -> Result<()> {
        let input = ramp(6, 6);
        let rois = Tensor::of_slice(&[0.0f32, 0.0, 0.0, 3.0, 3.0]).view([1, 5]);
        let output = roi_pool(&input, &rois, (2, 2), 1.0)?;
        let values = Vec::<f32>::from(&output.view([-1]));
        assert_eq!(values, vec![11.0, 13.0, 31.0, 33.0]);
        Ok(())
    }
}
