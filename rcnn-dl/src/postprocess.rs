//! Map detections from the network input resolution back to the requested output size.

use crate::{
    common::*,
    structures::{Instances, Keypoints},
};

const BYTES_PER_FLOAT: i64 = 4;
/// Transient memory ceiling when pasting masks on a GPU.
const GPU_MEM_LIMIT: i64 = 1 << 30;

/// Rescale detections to `output_size`.
///
/// Boxes are scaled, clipped and the instances whose box became empty are
/// dropped. Soft `pred_masks` are pasted into the output canvas and thresholded
/// by `mask_threshold`. Keypoint coordinates are scaled.
pub fn detector_postprocess(
    results: &Instances,
    output_size: &ImageSize,
    mask_threshold: f64,
) -> Result<Instances> {
    let (scale_y, scale_x) = results.image_size().scale_to(output_size);

    let mut output = Instances::new(*output_size);
    for (name, value) in results.fields() {
        output.set(name.as_str(), value.shallow_clone())?;
    }

    let box_field = if output.has("pred_boxes") {
        Some("pred_boxes")
    } else if output.has("proposal_boxes") {
        Some("proposal_boxes")
    } else {
        None
    };

    let output = match box_field {
        Some(field) => {
            let boxes = output
                .get_boxes(field)?
                .scale(scale_x, scale_y)
                .clip(output_size)?;
            let keep = boxes.nonempty(0.0);
            output.set(field, boxes)?;
            output.f_index(&keep)?
        }
        None => output,
    };

    let output = if output.has("pred_masks") {
        let boxes = output
            .get_boxes("pred_boxes")
            .context("pasting masks requires pred_boxes")?
            .tensor()
            .shallow_clone();
        let masks = output.get_tensor("pred_masks")?;
        let masks = match masks.dim() {
            4 => masks.select(1, 0),
            3 => masks.shallow_clone(),
            dim => bail!("pred_masks must be [N, 1, M, M] or [N, M, M], but get {} dims", dim),
        };
        let pasted = paste_masks_in_image(&masks, &boxes, output_size, mask_threshold)?;
        output.with("pred_masks", pasted)?
    } else {
        output
    };

    let output = if output.has("pred_keypoints") {
        let keypoints = output.get_keypoints("pred_keypoints")?.tensor();
        let scale = Tensor::of_slice(&[scale_x as f32, scale_y as f32, 1.0])
            .to_device(keypoints.device())
            .to_kind(keypoints.kind());
        let scaled = Keypoints::new(keypoints * scale)?;
        output.with("pred_keypoints", scaled)?
    } else {
        output
    };

    Ok(output)
}

/// Paste `[N, M, M]` soft masks into `[N, H, W]` boolean masks of the image,
/// each stretched over its `[N, 4]` box.
///
/// Masks are processed one by one on CPU, only over the region their box
/// covers. On GPU they are processed in chunks bounded by a memory ceiling.
pub fn paste_masks_in_image(
    masks: &Tensor,
    boxes: &Tensor,
    image_size: &ImageSize,
    threshold: f64,
) -> Result<Tensor> {
    let (num_masks, mask_h, mask_w) = masks.size3()?;
    ensure!(
        mask_h == mask_w,
        "only square masks are supported, but get {}x{}",
        mask_h,
        mask_w
    );
    ensure!(
        boxes.size() == [num_masks, 4],
        "expect [{}, 4] boxes, but get {:?}",
        num_masks,
        boxes.size()
    );
    ensure!(
        (0.0..=1.0).contains(&threshold),
        "mask threshold must be in [0, 1], but get {}",
        threshold
    );

    let device = masks.device();
    let img_h = image_size.h();
    let img_w = image_size.w();
    let img_masks = Tensor::zeros(&[num_masks, img_h, img_w], (Kind::Bool, device));
    if num_masks == 0 {
        return Ok(img_masks);
    }

    let (chunk_size, skip_empty) = if matches!(device, Device::Cuda(_)) {
        let num_chunks = (num_masks * img_h * img_w * BYTES_PER_FLOAT + GPU_MEM_LIMIT - 1) / GPU_MEM_LIMIT;
        let num_chunks = num_chunks.clamp(1, num_masks);
        ((num_masks + num_chunks - 1) / num_chunks, false)
    } else {
        (1, true)
    };

    let masks = masks.unsqueeze(1).to_kind(Kind::Float);
    let boxes = boxes.to_device(device).to_kind(Kind::Float);

    for start in (0..num_masks).step_by(chunk_size as usize) {
        let end = cmp::min(start + chunk_size, num_masks);
        let (pasted, region) = paste_mask_chunk(
            &masks.i(start..end),
            &boxes.i(start..end),
            img_h,
            img_w,
            skip_empty,
        )?;
        let PasteRegion { x0, y0, x1, y1 } = region;
        if x1 <= x0 || y1 <= y0 {
            continue;
        }
        img_masks
            .i((start..end, y0..y1, x0..x1))
            .copy_(&pasted.ge(threshold));
    }

    Ok(img_masks)
}

#[derive(Debug, Clone, Copy)]
struct PasteRegion {
    x0: i64,
    y0: i64,
    x1: i64,
    y1: i64,
}

/// Bilinearly resample `[N, 1, M, M]` masks into the image frame.
///
/// With `skip_empty`, only the region covered by the boxes is computed.
fn paste_mask_chunk(
    masks: &Tensor,
    boxes: &Tensor,
    img_h: i64,
    img_w: i64,
    skip_empty: bool,
) -> Result<(Tensor, PasteRegion)> {
    let num_masks = masks.size()[0];
    let device = masks.device();

    let region = if skip_empty {
        let min_corner = boxes.min_dim(0, false).0;
        let x0 = (f64::from(min_corner.get(0)).floor() as i64 - 1).max(0);
        let y0 = (f64::from(min_corner.get(1)).floor() as i64 - 1).max(0);
        let x1 = (f64::from(boxes.select(1, 2).max()).ceil() as i64 + 1).min(img_w);
        let y1 = (f64::from(boxes.select(1, 3).max()).ceil() as i64 + 1).min(img_h);
        PasteRegion { x0, y0, x1, y1 }
    } else {
        PasteRegion {
            x0: 0,
            y0: 0,
            x1: img_w,
            y1: img_h,
        }
    };
    let PasteRegion { x0, y0, x1, y1 } = region;
    if x1 <= x0 || y1 <= y0 {
        let empty = Tensor::zeros(&[num_masks, 0, 0], (Kind::Float, device));
        return Ok((empty, region));
    }

    let box_x0 = boxes.i((.., 0..1));
    let box_y0 = boxes.i((.., 1..2));
    let box_x1 = boxes.i((.., 2..3));
    let box_y1 = boxes.i((.., 3..4));

    // normalized sample coordinates of pixel centers, [-1, 1] over the box
    let img_y = Tensor::arange_start(y0, y1, (Kind::Float, device)) + 0.5;
    let img_x = Tensor::arange_start(x0, x1, (Kind::Float, device)) + 0.5;
    let img_y = (img_y.unsqueeze(0) - &box_y0) / (&box_y1 - &box_y0) * 2.0 - 1.0;
    let img_x = (img_x.unsqueeze(0) - &box_x0) / (&box_x1 - &box_x0) * 2.0 - 1.0;

    let height = y1 - y0;
    let width = x1 - x0;
    let grid_x = img_x.unsqueeze(1).expand(&[num_masks, height, width], false);
    let grid_y = img_y.unsqueeze(2).expand(&[num_masks, height, width], false);
    let grid = Tensor::stack(&[grid_x, grid_y], 3);

    let pasted = masks.f_grid_sampler(&grid, 0, 0, false)?.select(1, 0);
    Ok((pasted, region))
}

/// Apply [detector_postprocess] to every image, with an optional output size each.
pub fn postprocess_batch(
    results: &[Instances],
    output_sizes: Option<&[ImageSize]>,
    mask_threshold: f64,
) -> Result<Vec<Instances>> {
    match output_sizes {
        Some(sizes) => {
            ensure!(
                sizes.len() == results.len(),
                "expect {} output sizes, but get {}",
                results.len(),
                sizes.len()
            );
            izip!(results, sizes)
                .map(|(results, size)| detector_postprocess(results, size, mask_threshold))
                .try_collect()
        }
        None => results
            .iter()
            .map(|results| detector_postprocess(results, results.image_size(), mask_threshold))
            .try_collect(),
    }
}
