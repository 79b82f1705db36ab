//! Box classification and regression outputs of the second stage.

use crate::{
    box_transform::BoxTransform,
    common::*,
    structures::{Instances, InstancesList, ShapeSpec},
};

/// Class logits `[R, K + 1]` and box deltas `[R, C * B]` of R regions,
/// where C is 1 for class-agnostic regression and K otherwise.
#[derive(Debug, TensorLike)]
pub struct BoxPredictions {
    pub scores: Tensor,
    pub proposal_deltas: Tensor,
}

#[derive(Debug)]
pub struct FastRcnnOutputLayersInit {
    pub num_classes: i64,
    pub cls_agnostic_bbox_reg: bool,
    pub box_transform: BoxTransform,
    pub smooth_l1_beta: f64,
    pub test_score_thresh: f64,
    pub test_nms_thresh: f64,
    pub test_topk_per_image: i64,
}

impl FastRcnnOutputLayersInit {
    pub fn build<'p>(
        self,
        path: impl Borrow<nn::Path<'p>>,
        input_shape: ShapeSpec,
    ) -> Result<FastRcnnOutputLayers> {
        let path = path.borrow();
        let Self {
            num_classes,
            cls_agnostic_bbox_reg,
            box_transform,
            smooth_l1_beta,
            test_score_thresh,
            test_nms_thresh,
            test_topk_per_image,
        } = self;
        ensure!(num_classes > 0, "num_classes must be positive");

        let input_size = input_shape.prod();
        let box_dim = box_transform.box_dim();
        let num_bbox_reg_classes = if cls_agnostic_bbox_reg { 1 } else { num_classes };

        let cls_score = nn::linear(
            path / "cls_score",
            input_size,
            num_classes + 1,
            nn::LinearConfig {
                ws_init: nn::Init::Randn {
                    mean: 0.0,
                    stdev: 0.01,
                },
                bs_init: Some(nn::Init::Const(0.0)),
                bias: true,
            },
        );
        let bbox_pred = nn::linear(
            path / "bbox_pred",
            input_size,
            num_bbox_reg_classes * box_dim,
            nn::LinearConfig {
                ws_init: nn::Init::Randn {
                    mean: 0.0,
                    stdev: 0.001,
                },
                bs_init: Some(nn::Init::Const(0.0)),
                bias: true,
            },
        );

        Ok(FastRcnnOutputLayers {
            cls_score,
            bbox_pred,
            box_transform,
            smooth_l1_beta,
            test_score_thresh,
            test_nms_thresh,
            test_topk_per_image,
        })
    }
}

/// Linear class scores and box deltas over flattened region features.
#[derive(Debug, Getters)]
pub struct FastRcnnOutputLayers {
    cls_score: nn::Linear,
    bbox_pred: nn::Linear,
    #[get = "pub"]
    box_transform: BoxTransform,
    smooth_l1_beta: f64,
    test_score_thresh: f64,
    test_nms_thresh: f64,
    test_topk_per_image: i64,
}

impl FastRcnnOutputLayers {
    pub fn forward(&self, xs: &Tensor) -> BoxPredictions {
        let xs = if xs.dim() > 2 {
            xs.flatten(1, -1)
        } else {
            xs.shallow_clone()
        };
        BoxPredictions {
            scores: xs.apply(&self.cls_score),
            proposal_deltas: xs.apply(&self.bbox_pred),
        }
    }

    /// Softmax cross entropy `loss_cls` and smooth L1 `loss_box_reg`.
    ///
    /// Proposals must carry `proposal_boxes`, `gt_boxes` and `gt_classes`. The box
    /// loss is normalized by the number of regions rather than the foreground count.
    pub fn losses(
        &self,
        predictions: &BoxPredictions,
        proposals: &InstancesList,
    ) -> Result<LossDict> {
        let BoxPredictions {
            scores,
            proposal_deltas,
        } = predictions;
        let mut losses = LossDict::new();

        let num_regions: i64 = proposals.len_vec().into_iter().sum();
        if num_regions == 0 {
            losses.insert("loss_cls".into(), scores.sum(Kind::Float) * 0.0);
            losses.insert("loss_box_reg".into(), proposal_deltas.sum(Kind::Float) * 0.0);
            return Ok(losses);
        }

        let proposal_boxes = BoxTensor::cat(&proposals.get_boxes_vec("proposal_boxes")?)?;
        let gt_boxes = BoxTensor::cat(&proposals.get_boxes_vec("gt_boxes")?)?;
        let gt_classes = Tensor::f_cat(&proposals.get_tensor_vec("gt_classes")?, 0)?;
        ensure!(
            !proposal_boxes.tensor().requires_grad(),
            "proposal boxes should not require gradients"
        );
        log_accuracy(scores, &gt_classes);

        let loss_cls = CrossEntropyLoss::new(Reduction::Mean).forward(scores, &gt_classes);

        let gt_deltas = self
            .box_transform
            .get_deltas(proposal_boxes.tensor(), gt_boxes.tensor())?;
        let box_dim = self.box_transform.box_dim();
        let device = proposal_deltas.device();
        let bg_class = scores.size()[1] - 1;
        let cls_agnostic = proposal_deltas.size()[1] == box_dim;

        let fg_inds = gt_classes
            .ge(0i64)
            .logical_and(&gt_classes.lt(bg_class))
            .nonzero_1d();
        let box_cols = Tensor::arange(box_dim, (Kind::Int64, device));
        let gt_class_cols = if cls_agnostic {
            box_cols.unsqueeze(0)
        } else {
            gt_classes.index_select(0, &fg_inds).unsqueeze(1) * box_dim + box_cols
        };
        let loss_box_reg = SmoothL1Loss::new(self.smooth_l1_beta, Reduction::Sum).forward(
            &proposal_deltas.index(&[Some(fg_inds.unsqueeze(1)), Some(gt_class_cols)]),
            &gt_deltas.index_select(0, &fg_inds),
        ) / gt_classes.numel() as f64;

        losses.insert("loss_cls".into(), loss_cls);
        losses.insert("loss_box_reg".into(), loss_box_reg);
        Ok(losses)
    }

    /// Detections per image after score filtering and per-class NMS, with the
    /// index of the proposal each detection comes from.
    pub fn inference(
        &self,
        predictions: &BoxPredictions,
        proposals: &InstancesList,
    ) -> Result<(InstancesList, Vec<Tensor>)> {
        let boxes = self.predict_boxes(predictions, proposals)?;
        let scores = self.predict_probs(predictions, proposals)?;
        self.inference_with(&boxes, &scores, &proposals.image_sizes())
    }

    /// Run [fast_rcnn_inference] with this layer's test thresholds on given boxes and probabilities.
    pub fn inference_with(
        &self,
        boxes: &[Tensor],
        scores: &[Tensor],
        image_sizes: &[ImageSize],
    ) -> Result<(InstancesList, Vec<Tensor>)> {
        let infer = match self.box_transform {
            BoxTransform::Boxes(_) => fast_rcnn_inference,
            BoxTransform::Rotated(_) => fast_rcnn_inference_rotated,
        };
        infer(
            boxes,
            scores,
            image_sizes,
            self.test_score_thresh,
            self.test_nms_thresh,
            self.test_topk_per_image,
        )
    }

    /// Decoded `[R_i, C * B]` boxes for each image.
    pub fn predict_boxes(
        &self,
        predictions: &BoxPredictions,
        proposals: &InstancesList,
    ) -> Result<Vec<Tensor>> {
        if proposals.is_empty() {
            return Ok(vec![]);
        }
        let proposal_boxes = BoxTensor::cat(&proposals.get_boxes_vec("proposal_boxes")?)?;
        let boxes = self
            .box_transform
            .apply_deltas(&predictions.proposal_deltas, proposal_boxes.tensor())?;
        boxes.f_split_rows(&proposals.len_vec())
    }

    /// Decoded `[R_i, B]` boxes of each region's ground truth class.
    pub fn predict_boxes_for_gt_classes(
        &self,
        predictions: &BoxPredictions,
        proposals: &InstancesList,
    ) -> Result<Vec<Tensor>> {
        if proposals.is_empty() {
            return Ok(vec![]);
        }
        let proposal_boxes = BoxTensor::cat(&proposals.get_boxes_vec("proposal_boxes")?)?;
        let box_dim = proposal_boxes.box_dim();
        let num_regions = proposal_boxes.len();
        let boxes = self
            .box_transform
            .apply_deltas(&predictions.proposal_deltas, proposal_boxes.tensor())?;

        let num_bbox_reg_classes = boxes.size()[1] / box_dim;
        let boxes = if num_bbox_reg_classes > 1 {
            // background and ignored regions fall back to a valid column
            let gt_classes = Tensor::f_cat(&proposals.get_tensor_vec("gt_classes")?, 0)?
                .clamp(0, num_bbox_reg_classes - 1);
            boxes.view([num_regions, num_bbox_reg_classes, box_dim]).index(&[
                Some(Tensor::arange(num_regions, (Kind::Int64, boxes.device()))),
                Some(gt_classes),
            ])
        } else {
            boxes
        };
        boxes.f_split_rows(&proposals.len_vec())
    }

    /// Softmax class probabilities `[R_i, K + 1]` for each image.
    pub fn predict_probs(
        &self,
        predictions: &BoxPredictions,
        proposals: &InstancesList,
    ) -> Result<Vec<Tensor>> {
        predictions
            .scores
            .softmax(-1, Kind::Float)
            .f_split_rows(&proposals.len_vec())
    }
}

fn log_accuracy(scores: &Tensor, gt_classes: &Tensor) {
    let num_instances = gt_classes.numel();
    if num_instances == 0 {
        return;
    }
    let pred_classes = scores.argmax(1, false);
    let bg_class = scores.size()[1] - 1;

    let fg_mask = gt_classes.ge(0i64).logical_and(&gt_classes.lt(bg_class));
    let num_fg = fg_mask.count_true();
    let fg_gt_classes = gt_classes.index(&[Some(&fg_mask)]);
    let fg_pred_classes = pred_classes.index(&[Some(&fg_mask)]);

    let num_accurate = pred_classes.eq_tensor(gt_classes).count_true();
    debug!(
        "fast_rcnn/cls_accuracy: {}",
        num_accurate as f64 / num_instances as f64
    );
    if num_fg > 0 {
        let fg_num_accurate = fg_pred_classes.eq_tensor(&fg_gt_classes).count_true();
        let num_false_negative = fg_pred_classes.eq(bg_class).count_true();
        debug!(
            "fast_rcnn/fg_cls_accuracy: {}",
            fg_num_accurate as f64 / num_fg as f64
        );
        debug!(
            "fast_rcnn/false_negative: {}",
            num_false_negative as f64 / num_fg as f64
        );
    }
}

/// Per-image detection from decoded boxes `[R, C * 4]` and probabilities `[R, K + 1]`.
///
/// Non-finite rows are dropped, boxes are clipped, class scores above
/// `score_thresh` are kept, NMS runs per class and the `topk_per_image` best
/// survive (all of them if negative). Results carry `pred_boxes`, `scores` and
/// `pred_classes`, along with the kept proposal indices of each image.
pub fn fast_rcnn_inference(
    boxes: &[Tensor],
    scores: &[Tensor],
    image_sizes: &[ImageSize],
    score_thresh: f64,
    nms_thresh: f64,
    topk_per_image: i64,
) -> Result<(InstancesList, Vec<Tensor>)> {
    inference_per_image(
        boxes,
        scores,
        image_sizes,
        score_thresh,
        nms_thresh,
        topk_per_image,
        Boxes::BOX_DIM,
    )
}

/// Rotated counterpart of [fast_rcnn_inference] on `[R, C * 5]` boxes.
pub fn fast_rcnn_inference_rotated(
    boxes: &[Tensor],
    scores: &[Tensor],
    image_sizes: &[ImageSize],
    score_thresh: f64,
    nms_thresh: f64,
    topk_per_image: i64,
) -> Result<(InstancesList, Vec<Tensor>)> {
    inference_per_image(
        boxes,
        scores,
        image_sizes,
        score_thresh,
        nms_thresh,
        topk_per_image,
        RotatedBoxes::BOX_DIM,
    )
}

fn inference_per_image(
    boxes: &[Tensor],
    scores: &[Tensor],
    image_sizes: &[ImageSize],
    score_thresh: f64,
    nms_thresh: f64,
    topk_per_image: i64,
    box_dim: i64,
) -> Result<(InstancesList, Vec<Tensor>)> {
    ensure!(
        boxes.len() == scores.len() && boxes.len() == image_sizes.len(),
        "boxes, scores and image sizes of {}, {} and {} images do not agree",
        boxes.len(),
        scores.len(),
        image_sizes.len()
    );
    let (instances, indexes): (Vec<_>, Vec<_>) = izip!(boxes, scores, image_sizes)
        .map(|(boxes, scores, image_size)| {
            inference_single_image(
                boxes,
                scores,
                image_size,
                score_thresh,
                nms_thresh,
                topk_per_image,
                box_dim,
            )
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .unzip();
    Ok((InstancesList::new(instances), indexes))
}

fn inference_single_image(
    boxes: &Tensor,
    scores: &Tensor,
    image_size: &ImageSize,
    score_thresh: f64,
    nms_thresh: f64,
    topk_per_image: i64,
    box_dim: i64,
) -> Result<(Instances, Tensor)> {
    let valid_mask = boxes
        .isfinite()
        .all_dim(1, false)
        .logical_and(&scores.isfinite().all_dim(1, false));
    let (boxes, scores) = if valid_mask.count_true() != valid_mask.numel() as i64 {
        (boxes.f_select_rows(&valid_mask)?, scores.f_select_rows(&valid_mask)?)
    } else {
        (boxes.shallow_clone(), scores.shallow_clone())
    };

    // drop the background column
    let (num_rows, num_cols) = scores.size2()?;
    let scores = scores.i((.., 0..num_cols - 1));
    let num_bbox_reg_classes = boxes.size()[1] / box_dim;
    let boxes = BoxTensor::new(boxes.reshape(&[num_rows * num_bbox_reg_classes, box_dim]))?
        .clip(image_size)?
        .into_tensor()
        .view([num_rows, num_bbox_reg_classes, box_dim]);

    let filter_mask = scores.gt(score_thresh);
    // (region index, class index) of each candidate
    let filter_inds = filter_mask.nonzero();
    let boxes = if num_bbox_reg_classes == 1 {
        boxes.select(1, 0).index_select(0, &filter_inds.select(1, 0))
    } else {
        boxes.index(&[Some(&filter_mask)])
    };
    let scores = scores.index(&[Some(&filter_mask)]);

    let classes = filter_inds.select(1, 1);
    let keep = if box_dim == Boxes::BOX_DIM {
        batched_nms(&boxes, &scores, &classes, nms_thresh)?
    } else {
        batched_nms_rotated(&boxes, &scores, &classes, nms_thresh)?
    };
    let keep = if topk_per_image >= 0 {
        let num_keep = topk_per_image.min(keep.size()[0]);
        keep.i(0..num_keep)
    } else {
        keep
    };

    let filter_inds = filter_inds.index_select(0, &keep);
    let instances = Instances::new(*image_size)
        .with("pred_boxes", BoxTensor::new(boxes.index_select(0, &keep))?)?
        .with("scores", scores.index_select(0, &keep))?
        .with("pred_classes", filter_inds.select(1, 1))?;
    Ok((instances, filter_inds.select(1, 0)))
}
