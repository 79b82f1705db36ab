use crate::{boxes::Boxes, common::*, rotated_boxes::RotatedBoxes, tensor::TensorExt};

/// Above this many boxes, [batched_nms] suppresses each category separately
/// instead of offsetting all boxes into one call.
pub const BATCHED_NMS_LOOP_THRESHOLD: i64 = 40000;

/// Greedy non-maximum suppression on axis-aligned `[N, 4]` boxes.
///
/// Returns int64 indices of kept boxes in decreasing score order. A box is
/// suppressed when its IoU with a kept higher-scoring box exceeds `iou_threshold`.
pub fn nms(boxes: &Tensor, scores: &Tensor, iou_threshold: f64) -> Result<Tensor> {
    check_nms_input(boxes, scores, Boxes::BOX_DIM)?;
    let device = boxes.device();
    let rects = Boxes::new(boxes.detach().to_device(Device::Cpu))?.to_xyxy_vec();
    let scores = host_scores(scores);
    let keep = greedy_nms(&rects, &scores, iou_threshold, |lhs, rhs| {
        lhs.iou_with(rhs) as f64
    });
    Ok(Tensor::of_slice(&keep).to_device(device))
}

/// Greedy non-maximum suppression on rotated `[N, 5]` boxes.
pub fn nms_rotated(boxes: &Tensor, scores: &Tensor, iou_threshold: f64) -> Result<Tensor> {
    check_nms_input(boxes, scores, RotatedBoxes::BOX_DIM)?;
    let device = boxes.device();
    let rects = RotatedBoxes::new(boxes.detach().to_device(Device::Cpu))?.to_rects();
    let scores = host_scores(scores);
    let keep = greedy_nms(&rects, &scores, iou_threshold, |lhs, rhs| lhs.iou_with(rhs));
    Ok(Tensor::of_slice(&keep).to_device(device))
}

/// Suppress boxes independently per category given by `idxs`.
///
/// Boxes of different categories never suppress each other. The result holds
/// int64 indices in decreasing score order.
pub fn batched_nms(
    boxes: &Tensor,
    scores: &Tensor,
    idxs: &Tensor,
    iou_threshold: f64,
) -> Result<Tensor> {
    check_nms_input(boxes, scores, Boxes::BOX_DIM)?;
    ensure!(
        idxs.size() == scores.size(),
        "idxs shape {:?} does not match scores shape {:?}",
        idxs.size(),
        scores.size()
    );
    let num_boxes = boxes.size()[0];
    if num_boxes == 0 {
        return Ok(Tensor::empty(&[0], (Kind::Int64, boxes.device())));
    }

    if num_boxes < BATCHED_NMS_LOOP_THRESHOLD {
        tch::no_grad(|| {
            // shift each category far apart so that they never overlap
            let max_coordinate = boxes.max();
            let offsets = idxs.to_kind(boxes.kind()) * (max_coordinate + 1.0);
            let boxes_for_nms = boxes + offsets.unsqueeze(1);
            nms(&boxes_for_nms, scores, iou_threshold)
        })
    } else {
        debug!("suppress {} boxes per category", num_boxes);
        batched_nms_by_category(boxes, scores, idxs, iou_threshold, nms)
    }
}

/// Rotated counterpart of [batched_nms].
///
/// The offset spans the full projected extent since rotated boxes may reach
/// negative coordinates.
pub fn batched_nms_rotated(
    boxes: &Tensor,
    scores: &Tensor,
    idxs: &Tensor,
    iou_threshold: f64,
) -> Result<Tensor> {
    check_nms_input(boxes, scores, RotatedBoxes::BOX_DIM)?;
    ensure!(
        idxs.size() == scores.size(),
        "idxs shape {:?} does not match scores shape {:?}",
        idxs.size(),
        scores.size()
    );
    if boxes.size()[0] == 0 {
        return Ok(Tensor::empty(&[0], (Kind::Int64, boxes.device())));
    }

    tch::no_grad(|| {
        let centers = boxes.i((.., 0..2));
        let max_side = boxes.select(1, 2).maximum(&boxes.select(1, 3));
        let max_coordinate =
            (boxes.select(1, 0).maximum(&boxes.select(1, 1)) + &max_side / 2.0).max();
        let min_coordinate =
            (boxes.select(1, 0).minimum(&boxes.select(1, 1)) - &max_side / 2.0).min();
        let offsets =
            idxs.to_kind(boxes.kind()) * (max_coordinate - min_coordinate + 1.0);

        let boxes_for_nms = Tensor::cat(
            &[centers + offsets.unsqueeze(1), boxes.i((.., 2..5))],
            1,
        );
        nms_rotated(&boxes_for_nms, scores, iou_threshold)
    })
}

fn batched_nms_by_category<F>(
    boxes: &Tensor,
    scores: &Tensor,
    idxs: &Tensor,
    iou_threshold: f64,
    nms_fn: F,
) -> Result<Tensor>
where
    F: Fn(&Tensor, &Tensor, f64) -> Result<Tensor>,
{
    let device = boxes.device();
    let num_boxes = boxes.size()[0];
    let mut result_mask = Tensor::zeros(&[num_boxes], (Kind::Bool, device));
    let categories: Vec<i64> = Vec::<i64>::from(&idxs.to_kind(Kind::Int64).to_device(Device::Cpu));
    let marker = Tensor::of_slice(&[true]).to_device(device);

    for category in categories.into_iter().unique() {
        let mask = idxs.eq(category).nonzero_1d();
        let keep = nms_fn(
            &boxes.select_rows(&mask),
            &scores.select_rows(&mask),
            iou_threshold,
        )?;
        let _ = result_mask.index_put_(&[Some(mask.select_rows(&keep))], &marker, false);
    }

    let keep = result_mask.nonzero_1d();
    let (_, order) = scores.select_rows(&keep).sort(0, true);
    Ok(keep.select_rows(&order))
}

fn check_nms_input(boxes: &Tensor, scores: &Tensor, box_dim: i64) -> Result<()> {
    let num_boxes = match boxes.size().as_slice() {
        &[n, d] if d == box_dim => n,
        shape => bail!("expect [N, {}] boxes, but get shape {:?}", box_dim, shape),
    };
    ensure!(
        scores.size() == vec![num_boxes],
        "expect scores of shape [{}], but get {:?}",
        num_boxes,
        scores.size()
    );
    Ok(())
}

fn host_scores(scores: &Tensor) -> Vec<f32> {
    Vec::<f32>::from(&scores.detach().to_kind(Kind::Float).to_device(Device::Cpu))
}

fn greedy_nms<B, F>(rects: &[B], scores: &[f32], iou_threshold: f64, iou_fn: F) -> Vec<i64>
where
    F: Fn(&B, &B) -> f64,
{
    let mut order: Vec<usize> = (0..rects.len()).collect();
    order.sort_by(|&lhs, &rhs| {
        scores[rhs]
            .partial_cmp(&scores[lhs])
            .unwrap_or(Ordering::Equal)
    });

    let mut suppressed = vec![false; rects.len()];
    let mut keep = vec![];

    for (pos, &li) in order.iter().enumerate() {
        if suppressed[li] {
            continue;
        }
        keep.push(li as i64);
        let lhs = &rects[li];

        for &ri in &order[(pos + 1)..] {
            if !suppressed[ri] && iou_fn(lhs, &rects[ri]) > iou_threshold {
                suppressed[ri] = true;
            }
        }
    }

    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn random_boxes(rng: &mut StdRng, n: usize) -> (Tensor, Tensor) {
        let values: Vec<f32> = (0..n)
            .flat_map(|_| {
                let x1 = rng.gen_range(0.0..50.0);
                let y1 = rng.gen_range(0.0..50.0);
                let w = rng.gen_range(1.0..30.0);
                let h = rng.gen_range(1.0..30.0);
                vec![x1, y1, x1 + w, y1 + h]
            })
            .collect();
        let scores: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0..1.0)).collect();
        (
            Tensor::of_slice(&values).view([-1, 4]),
            Tensor::of_slice(&scores),
        )
    }

    #[test]
    fn nms_suppresses_overlaps() -> Result<()> {
        let boxes = Tensor::of_slice(&[
            0.0f32, 0.0, 10.0, 10.0, //
            1.0, 1.0, 11.0, 11.0, //
            20.0, 20.0, 30.0, 30.0, //
            0.0, 0.0, 10.0, 9.0,
        ])
        .view([-1, 4]);
        let scores = Tensor::of_slice(&[0.8f32, 0.9, 0.5, 0.95]);
        let keep = Vec::<i64>::from(&nms(&boxes, &scores, 0.5)?);
        assert_eq!(keep, vec![3, 2]);

        let keep = Vec::<i64>::from(&nms(&boxes, &scores, 0.95)?);
        assert_eq!(keep, vec![3, 1, 0, 2]);
        Ok(())
    }

    #[test]
    fn nms_output_is_non_overlapping() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let (boxes, scores) = random_boxes(&mut rng, 200);
        let keep = nms(&boxes, &scores, 0.3)?;
        let kept = Boxes::new(boxes.select_rows(&keep))?;
        let iou = Boxes::pairwise_iou(&kept, &kept)
            - Tensor::eye(keep.size()[0], (Kind::Float, Device::Cpu));
        assert!(f64::from(iou.max()) <= 0.3 + 1e-6);

        let kept_scores = Vec::<f32>::from(&scores.select_rows(&keep));
        assert!(kept_scores.windows(2).all(|w| w[0] >= w[1]));
        Ok(())
    }

    #[test]
    fn batched_nms_single_category_matches_nms() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        let (boxes, scores) = random_boxes(&mut rng, 100);
        let idxs = Tensor::zeros(&[100], (Kind::Int64, Device::Cpu));
        let lhs = Vec::<i64>::from(&batched_nms(&boxes, &scores, &idxs, 0.5)?);
        let rhs = Vec::<i64>::from(&nms(&boxes, &scores, 0.5)?);
        assert_eq!(lhs, rhs);
        Ok(())
    }

    #[test]
    fn batched_nms_category_loop_agrees() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(13);
        let (boxes, scores) = random_boxes(&mut rng, 150);
        let idxs_vec: Vec<i64> = (0..150).map(|_| rng.gen_range(0..4)).collect();
        let idxs = Tensor::of_slice(&idxs_vec);

        let offset = Vec::<i64>::from(&batched_nms(&boxes, &scores, &idxs, 0.5)?);
        let looped = Vec::<i64>::from(&batched_nms_by_category(
            &boxes, &scores, &idxs, 0.5, nms,
        )?);
        assert_eq!(offset, looped);
        Ok(())
    }

    #[test]
    fn batched_nms_keeps_other_categories() -> Result<()> {
        let boxes = Tensor::of_slice(&[0.0f32, 0.0, 10.0, 10.0, 0.0, 0.0, 10.0, 10.0]).view([-1, 4]);
        let scores = Tensor::of_slice(&[0.9f32, 0.8]);
        let idxs = Tensor::of_slice(&[0i64, 1]);
        let keep = Vec::<i64>::from(&batched_nms(&boxes, &scores, &idxs, 0.5)?);
        assert_eq!(keep, vec![0, 1]);

        let empty = batched_nms(
            &Tensor::zeros(&[0, 4], (Kind::Float, Device::Cpu)),
            &Tensor::zeros(&[0], (Kind::Float, Device::Cpu)),
            &Tensor::zeros(&[0], (Kind::Int64, Device::Cpu)),
            0.5,
        )?;
        assert_eq!(empty.size(), vec![0]);
        assert_eq!(empty.kind(), Kind::Int64);
        Ok(())
    }

    #[test]
    fn batched_nms_rotated_negative_coordinates() -> Result<()> {
        let boxes = Tensor::of_slice(&[
            -5.0f32, -5.0, 10.0, 4.0, 30.0, //
            -5.0, -5.0, 10.0, 4.0, 30.0, //
            -5.0, -5.0, 10.0, 4.0, 32.0,
        ])
        .view([-1, 5]);
        let scores = Tensor::of_slice(&[0.5f32, 0.6, 0.7]);
        let idxs = Tensor::of_slice(&[0i64, 1, 0]);
        let keep = Vec::<i64>::from(&batched_nms_rotated(&boxes, &scores, &idxs, 0.5)?);
        assert_eq!(keep, vec![2, 1]);

        let keep = Vec::<i64>::from(&nms_rotated(&boxes, &scores, 0.5)?);
        assert_eq!(keep, vec![2]);
        Ok(())
    }
}
