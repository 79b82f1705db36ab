use super::StandardRpnHead;
use crate::{
    anchor_generator::{AnchorGenerator, AnchorGeneratorInit, AnchorGeneratorKind},
    box_transform::{default_scale_clamp, BoxTransform},
    common::*,
    matcher::{Matcher, MatcherInit},
    sampling::subsample_labels,
    structures::{ImageList, Instances, InstancesList, ShapeSpec},
};

/// Region proposal network settings, the `MODEL.RPN` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpnInit {
    pub in_features: Vec<String>,
    /// Anchors reaching beyond the image by more than this many pixels are ignored.
    /// A negative value disables the check.
    pub boundary_thresh: i64,
    pub iou_thresholds: Vec<R64>,
    pub iou_labels: Vec<i64>,
    pub batch_size_per_image: i64,
    pub positive_fraction: R64,
    pub bbox_reg_weights: Vec<R64>,
    pub smooth_l1_beta: R64,
    pub loss_weight: R64,
    pub pre_nms_topk_train: i64,
    pub pre_nms_topk_test: i64,
    pub post_nms_topk_train: i64,
    pub post_nms_topk_test: i64,
    pub nms_thresh: R64,
}

impl Default for RpnInit {
    fn default() -> Self {
        Self {
            in_features: vec!["res4".into()],
            boundary_thresh: -1,
            iou_thresholds: vec![r64(0.3), r64(0.7)],
            iou_labels: vec![0, -1, 1],
            batch_size_per_image: 256,
            positive_fraction: r64(0.5),
            bbox_reg_weights: vec![r64(1.0); 4],
            smooth_l1_beta: r64(0.0),
            loss_weight: r64(1.0),
            pre_nms_topk_train: 12000,
            pre_nms_topk_test: 6000,
            post_nms_topk_train: 2000,
            post_nms_topk_test: 1000,
            nms_thresh: r64(0.7),
        }
    }
}

impl RpnInit {
    /// Build an RPN over the `in_features` entries of `input_shapes`.
    ///
    /// Proposals with a side shorter than `min_box_size` are dropped.
    pub fn build<'p>(
        self,
        path: impl Borrow<nn::Path<'p>>,
        input_shapes: &IndexMap<String, ShapeSpec>,
        anchor_generator: AnchorGeneratorInit,
        min_box_size: f64,
    ) -> Result<Rpn> {
        let path = path.borrow();
        let Self {
            in_features,
            boundary_thresh,
            iou_thresholds,
            iou_labels,
            batch_size_per_image,
            positive_fraction,
            bbox_reg_weights,
            smooth_l1_beta,
            loss_weight,
            pre_nms_topk_train,
            pre_nms_topk_test,
            post_nms_topk_train,
            post_nms_topk_test,
            nms_thresh,
        } = self;

        ensure!(!in_features.is_empty(), "RPN requires at least one input feature");
        ensure!(batch_size_per_image > 0, "batch_size_per_image must be positive");
        ensure!(
            pre_nms_topk_train > 0
                && pre_nms_topk_test > 0
                && post_nms_topk_train > 0
                && post_nms_topk_test > 0,
            "top-k sizes must be positive"
        );

        let strides: Vec<i64> = in_features
            .iter()
            .map(|name| {
                input_shapes
                    .get(name)
                    .ok_or_else(|| format_err!("the input feature '{}' does not exist", name))?
                    .try_stride()
            })
            .try_collect()?;
        let in_channels = crate::structures::shared_channels(input_shapes, &in_features)?;

        let anchor_generator = anchor_generator.build(&strides)?;
        let num_anchors = anchor_generator.num_anchors()[0];
        ensure!(
            anchor_generator
                .num_anchors()
                .iter()
                .all(|&count| count == num_anchors),
            "every feature level must have the same number of anchors, but get {:?}",
            anchor_generator.num_anchors()
        );
        let box_transform = BoxTransform::new(&bbox_reg_weights, default_scale_clamp())?;
        ensure!(
            box_transform.box_dim() == anchor_generator.box_dim(),
            "{} box regression weights do not match {}-d anchors",
            bbox_reg_weights.len(),
            anchor_generator.box_dim()
        );

        let head = StandardRpnHead::new(
            path / "rpn_head",
            in_channels,
            num_anchors,
            anchor_generator.box_dim(),
        )?;
        let anchor_matcher = MatcherInit {
            thresholds: iou_thresholds,
            labels: iou_labels,
            allow_low_quality_matches: true,
        }
        .build()?;

        Ok(Rpn {
            in_features,
            anchor_generator,
            head,
            anchor_matcher,
            box_transform,
            boundary_thresh,
            batch_size_per_image,
            positive_fraction: positive_fraction.raw(),
            smooth_l1_beta: smooth_l1_beta.raw(),
            loss_weight: loss_weight.raw(),
            pre_nms_topk: [pre_nms_topk_test, pre_nms_topk_train],
            post_nms_topk: [post_nms_topk_test, post_nms_topk_train],
            nms_thresh: nms_thresh.raw(),
            min_box_size,
        })
    }

    /// Build the rotated variant. It requires rotated anchors, 5 regression weights
    /// and a disabled boundary check.
    pub fn build_rotated<'p>(
        self,
        path: impl Borrow<nn::Path<'p>>,
        input_shapes: &IndexMap<String, ShapeSpec>,
        anchor_generator: AnchorGeneratorInit,
        min_box_size: f64,
    ) -> Result<Rrpn> {
        ensure!(
            self.boundary_thresh < 0,
            "the anchor boundary check is not supported for rotated proposals"
        );
        ensure!(
            anchor_generator.name == AnchorGeneratorKind::Rotated,
            "rotated proposals require the rotated anchor generator"
        );
        let rpn = self.build(path, input_shapes, anchor_generator, min_box_size)?;
        Ok(Rrpn(rpn))
    }
}

/// Region proposal network over axis-aligned or rotated anchors.
#[derive(Debug)]
pub struct Rpn {
    in_features: Vec<String>,
    anchor_generator: AnchorGenerator,
    head: StandardRpnHead,
    anchor_matcher: Matcher,
    box_transform: BoxTransform,
    boundary_thresh: i64,
    batch_size_per_image: i64,
    positive_fraction: f64,
    smooth_l1_beta: f64,
    loss_weight: f64,
    /// Indexed by the training flag.
    pre_nms_topk: [i64; 2],
    post_nms_topk: [i64; 2],
    nms_thresh: f64,
    min_box_size: f64,
}

impl Rpn {
    pub fn in_features(&self) -> &[String] {
        &self.in_features
    }

    pub fn anchor_generator(&self) -> &AnchorGenerator {
        &self.anchor_generator
    }

    /// Predict proposals for each image, and compute losses in training.
    ///
    /// Proposals carry the `proposal_boxes` and `objectness_logits` fields.
    /// Ground truth instances with a `gt_boxes` field are required in training.
    pub fn forward_t(
        &self,
        images: &ImageList,
        features: &FeatureMap,
        gt_instances: Option<&InstancesList>,
        train: bool,
    ) -> Result<(InstancesList, LossDict)> {
        let features: Vec<&Tensor> = self
            .in_features
            .iter()
            .map(|name| {
                features
                    .get(name)
                    .ok_or_else(|| format_err!("the feature '{}' is missing", name))
            })
            .try_collect()?;
        let num_images = images.len() as i64;
        let box_dim = self.anchor_generator.box_dim();

        let anchors = self.anchor_generator.forward(&features)?;
        let (pred_objectness_logits, pred_anchor_deltas) = self.head.forward_t(&features, train);

        // (N, A, H, W) -> (N, H * W * A)
        let pred_objectness_logits: Vec<Tensor> = pred_objectness_logits
            .iter()
            .map(|logits| logits.permute(&[0, 2, 3, 1]).flatten(1, -1))
            .collect();
        // (N, A * B, H, W) -> (N, H * W * A, B)
        let pred_anchor_deltas: Vec<Tensor> = pred_anchor_deltas
            .iter()
            .map(|deltas| -> Result<_> {
                let (n, _, h, w) = deltas.size4()?;
                Ok(deltas
                    .view([n, -1, box_dim, h, w])
                    .permute(&[0, 3, 4, 1, 2])
                    .flatten(1, -2))
            })
            .try_collect()?;

        let losses = if train {
            let gt_instances = gt_instances
                .ok_or_else(|| format_err!("ground truth instances are required in training"))?;
            ensure!(
                gt_instances.len() as i64 == num_images,
                "expect ground truth for {} images, but get {}",
                num_images,
                gt_instances.len()
            );
            let (gt_labels, gt_boxes) = self.label_and_sample_anchors(&anchors, gt_instances)?;
            self.losses(
                &anchors,
                &pred_objectness_logits,
                &gt_labels,
                &pred_anchor_deltas,
                &gt_boxes,
            )?
        } else {
            LossDict::new()
        };

        let proposals = tch::no_grad(|| -> Result<_> {
            let pred_proposals = self.predict_proposals(&anchors, &pred_anchor_deltas, num_images)?;
            find_top_proposals(
                &pred_proposals,
                &pred_objectness_logits,
                images.image_sizes(),
                self.nms_thresh,
                self.pre_nms_topk[train as usize],
                self.post_nms_topk[train as usize],
                self.min_box_size,
                train,
            )
        })?;

        Ok((proposals, losses))
    }

    /// Assign each anchor a label in {-1, 0, 1} and a matched ground truth box.
    ///
    /// Returns one `[R]` int8 label tensor and one `[R, B]` box tensor per image,
    /// where R is the total number of anchors over all levels.
    pub fn label_and_sample_anchors(
        &self,
        anchors: &[BoxTensor],
        gt_instances: &InstancesList,
    ) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
        tch::no_grad(|| {
            let anchors = BoxTensor::cat(anchors)?;

            let (gt_labels, matched_gt_boxes) = gt_instances
                .iter()
                .map(|instances| -> Result<_> {
                    let gt_boxes = instances.get_boxes("gt_boxes")?;
                    let quality = BoxTensor::pairwise_iou(gt_boxes, &anchors)?;
                    let (matched_idxs, labels) = self.anchor_matcher.forward(&quality)?;
                    let mut labels = labels.to_device(gt_boxes.device());

                    if self.boundary_thresh >= 0 {
                        let inside =
                            anchors.inside_box(instances.image_size(), self.boundary_thresh);
                        let _ = labels.masked_fill_(&inside.logical_not(), -1i64);
                    }
                    let labels = self.subsample_labels(labels)?;

                    let matched_gt_boxes = if gt_boxes.is_empty() {
                        anchors.tensor().zeros_like()
                    } else {
                        gt_boxes.tensor().index_select(0, &matched_idxs)
                    };
                    Ok((labels, matched_gt_boxes))
                })
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .unzip();
            Ok((gt_labels, matched_gt_boxes))
        })
    }

    /// Keep a balanced random subset of labels and mark the rest as ignored.
    fn subsample_labels(&self, mut labels: Tensor) -> Result<Tensor> {
        let (pos_idx, neg_idx) = subsample_labels(
            &labels,
            self.batch_size_per_image,
            self.positive_fraction,
            0,
        )?;
        let _ = labels.fill_(-1i64);
        let _ = labels.index_fill_(0, &pos_idx, 1i64);
        let _ = labels.index_fill_(0, &neg_idx, 0i64);
        Ok(labels)
    }

    fn losses(
        &self,
        anchors: &[BoxTensor],
        pred_objectness_logits: &[Tensor],
        gt_labels: &[Tensor],
        pred_anchor_deltas: &[Tensor],
        gt_boxes: &[Tensor],
    ) -> Result<LossDict> {
        let num_images = gt_labels.len() as i64;
        let anchors = BoxTensor::cat(anchors)?;
        let gt_labels = Tensor::stack(gt_labels, 0);
        let gt_anchor_deltas: Vec<_> = gt_boxes
            .iter()
            .map(|gt_boxes| self.box_transform.get_deltas(anchors.tensor(), gt_boxes))
            .try_collect()?;
        let gt_anchor_deltas = Tensor::stack(&gt_anchor_deltas, 0);

        let pos_mask = gt_labels.eq(1i64);
        let num_pos_anchors = pos_mask.count_true();
        let num_neg_anchors = gt_labels.eq(0i64).count_true();
        debug!(
            "rpn/num_pos_anchors: {}",
            num_pos_anchors as f64 / num_images as f64
        );
        debug!(
            "rpn/num_neg_anchors: {}",
            num_neg_anchors as f64 / num_images as f64
        );

        let pred_objectness_logits = Tensor::cat(pred_objectness_logits, 1);
        let pred_anchor_deltas = Tensor::cat(pred_anchor_deltas, 1);

        let localization_loss = SmoothL1Loss::new(self.smooth_l1_beta, Reduction::Sum).forward(
            &pred_anchor_deltas.index(&[Some(&pos_mask)]),
            &gt_anchor_deltas.index(&[Some(&pos_mask)]),
        );
        let valid_mask = gt_labels.ge(0i64);
        let objectness_loss = BceWithLogitsLossInit::default(Reduction::Sum).build().forward(
            &pred_objectness_logits.index(&[Some(&valid_mask)]),
            &gt_labels.index(&[Some(&valid_mask)]).to_kind(Kind::Float),
        );

        let normalizer = (self.batch_size_per_image * num_images) as f64;
        let mut losses = LossDict::new();
        losses.insert(
            "loss_rpn_cls".into(),
            objectness_loss / normalizer * self.loss_weight,
        );
        losses.insert(
            "loss_rpn_loc".into(),
            localization_loss / normalizer * self.loss_weight,
        );
        Ok(losses)
    }

    /// Decode per-level deltas into `[N, H * W * A, B]` proposal boxes.
    fn predict_proposals(
        &self,
        anchors: &[BoxTensor],
        pred_anchor_deltas: &[Tensor],
        num_images: i64,
    ) -> Result<Vec<Tensor>> {
        ensure!(
            anchors.len() == pred_anchor_deltas.len(),
            "anchor and delta level counts differ"
        );
        izip!(anchors, pred_anchor_deltas)
            .map(|(anchors, deltas)| {
                let box_dim = anchors.box_dim();
                let deltas = deltas.reshape(&[-1, box_dim]);
                let anchors = anchors
                    .tensor()
                    .unsqueeze(0)
                    .expand(&[num_images, -1, -1], false)
                    .reshape(&[-1, box_dim]);
                let proposals = self.box_transform.apply_deltas(&deltas, &anchors)?;
                Ok(proposals.view([num_images, -1, box_dim]))
            })
            .try_collect()
    }
}

/// Region proposal network over rotated anchors.
#[derive(Debug)]
pub struct Rrpn(Rpn);

impl Rrpn {
    pub fn forward_t(
        &self,
        images: &ImageList,
        features: &FeatureMap,
        gt_instances: Option<&InstancesList>,
        train: bool,
    ) -> Result<(InstancesList, LossDict)> {
        self.0.forward_t(images, features, gt_instances, train)
    }
}

impl Deref for Rrpn {
    type Target = Rpn;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Select the best proposals of each image.
///
/// `proposals` holds `[N, R_l, B]` boxes and `pred_objectness_logits` the `[N, R_l]`
/// scores of each level. The `pre_nms_topk` highest scoring boxes of each level
/// are kept, then per image the boxes are clipped, small boxes are dropped,
/// NMS runs independently per level, and the `post_nms_topk` best survive.
///
/// Non-finite candidates are dropped in inference and are an error in training.
#[allow(clippy::too_many_arguments)]
pub fn find_top_proposals(
    proposals: &[Tensor],
    pred_objectness_logits: &[Tensor],
    image_sizes: &[ImageSize],
    nms_thresh: f64,
    pre_nms_topk: i64,
    post_nms_topk: i64,
    min_box_size: f64,
    train: bool,
) -> Result<InstancesList> {
    ensure!(
        !proposals.is_empty() && proposals.len() == pred_objectness_logits.len(),
        "proposals and logits must have the same positive number of levels"
    );
    let num_images = image_sizes.len() as i64;
    let device = proposals[0].device();
    let batch_idx = Tensor::arange(num_images, (Kind::Int64, device));

    // 1. keep the top-scoring anchors of every level and image
    let (topk_proposals, topk_scores, level_ids): (Vec<_>, Vec<_>, Vec<_>) =
        izip!(proposals, pred_objectness_logits)
            .enumerate()
            .map(|(level, (proposals, logits))| -> Result<_> {
                let (_, num_anchors) = logits.size2()?;
                let num_keep = pre_nms_topk.min(num_anchors);
                // a full sort is faster than topk here
                let (sorted, order) = logits.sort(1, true);
                let topk_scores = sorted.i((.., 0..num_keep));
                let topk_idx = order.i((.., 0..num_keep));
                let topk_proposals =
                    proposals.index(&[Some(batch_idx.unsqueeze(1)), Some(topk_idx)]);
                let level_ids = Tensor::full(&[num_keep], level as i64, (Kind::Int64, device));
                Ok((topk_proposals, topk_scores, level_ids))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip_n_vec();

    // 2. concatenate all levels
    let topk_proposals = Tensor::cat(&topk_proposals, 1);
    let topk_scores = Tensor::cat(&topk_scores, 1);
    let level_ids = Tensor::cat(&level_ids, 0);

    // 3. NMS per image and level
    image_sizes
        .iter()
        .enumerate()
        .map(|(index, image_size)| {
            let index = index as i64;
            let mut boxes = BoxTensor::new(topk_proposals.get(index))?;
            let mut scores = topk_scores.get(index);
            let mut levels = level_ids.shallow_clone();

            let valid_mask = boxes
                .tensor()
                .isfinite()
                .all_dim(1, false)
                .logical_and(&scores.isfinite());
            if !bool::from(valid_mask.all()) {
                ensure!(
                    !train,
                    "predicted boxes or scores contain Inf/NaN, training has diverged"
                );
                boxes = boxes.f_index(&valid_mask)?;
                scores = scores.f_select_rows(&valid_mask)?;
                levels = levels.f_select_rows(&valid_mask)?;
            }

            let boxes = boxes.clip(image_size)?;
            let keep = boxes.nonempty(min_box_size);
            let (boxes, scores, levels) = if keep.count_true() != boxes.len() {
                (
                    boxes.f_index(&keep)?,
                    scores.f_select_rows(&keep)?,
                    levels.f_select_rows(&keep)?,
                )
            } else {
                (boxes, scores, levels)
            };

            let keep = match &boxes {
                BoxTensor::Boxes(_) => batched_nms(boxes.tensor(), &scores, &levels, nms_thresh)?,
                BoxTensor::Rotated(_) => {
                    batched_nms_rotated(boxes.tensor(), &scores, &levels, nms_thresh)?
                }
            };
            let num_keep = post_nms_topk.min(keep.size()[0]);
            let keep = keep.i(0..num_keep);

            Instances::new(*image_size)
                .with("proposal_boxes", boxes.f_index(&keep)?)?
                .with("objectness_logits", scores.index_select(0, &keep))
        })
        .collect::<Result<Vec<_>>>()
        .map(InstancesList::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shapes() -> IndexMap<String, ShapeSpec> {
        let mut shapes = IndexMap::new();
        shapes.insert("p3".to_string(), ShapeSpec::new(8, 8));
        shapes
    }

    fn build_rpn(vs: &nn::VarStore, batch_size_per_image: i64) -> Result<Rpn> {
        RpnInit {
            in_features: vec!["p3".into()],
            batch_size_per_image,
            ..Default::default()
        }
        .build(
            &vs.root() / "rpn",
            &shapes(),
            AnchorGeneratorInit {
                sizes: vec![vec![r64(16.0)]],
                aspect_ratios: vec![vec![r64(1.0)]],
                offset: r64(0.0),
                ..Default::default()
            },
            0.0,
        )
    }

    #[test]
    fn label_anchors_by_iou() -> Result<()> {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let rpn = build_rpn(&vs, 256)?;

        let feature = Tensor::zeros(&[1, 8, 4, 4], (Kind::Float, Device::Cpu));
        let anchors = rpn.anchor_generator().forward(&[&feature])?;
        let gt = Instances::new(ImageSize::new_size(32, 32)?)
            .with("gt_boxes", Boxes::from_xyxy(&[[-8.0, -8.0, 8.0, 8.0]])?)?;
        let (labels, matched) =
            rpn.label_and_sample_anchors(&anchors, &InstancesList::new(vec![gt]))?;

        let labels = Vec::<i8>::from(&labels[0]);
        assert_eq!(labels.len(), 16);
        // the anchor at the origin coincides with the ground truth
        assert_eq!(labels[0], 1);
        assert_eq!(labels.iter().filter(|&&label| label == 1).count(), 1);
        assert!(labels.iter().all(|&label| label == 1 || label == 0 || label == -1));
        assert_eq!(matched[0].size(), vec![16, 4]);
        Ok(())
    }

    #[test]
    fn losses_and_proposals() -> Result<()> {
        tch::manual_seed(1);
        let vs = nn::VarStore::new(Device::Cpu);
        let rpn = build_rpn(&vs, 8)?;

        let images = ImageList::from_parts(
            Tensor::zeros(&[1, 3, 32, 32], (Kind::Float, Device::Cpu)),
            vec![ImageSize::new_size(32, 32)?],
        )?;
        let mut features = FeatureMap::new();
        features.insert(
            "p3".into(),
            Tensor::randn(&[1, 8, 4, 4], (Kind::Float, Device::Cpu)),
        );
        let gt = Instances::new(ImageSize::new_size(32, 32)?).with(
            "gt_boxes",
            Boxes::from_xyxy(&[[0.0, 0.0, 10.0, 12.0], [16.0, 16.0, 30.0, 28.0]])?,
        )?;
        let gt = InstancesList::new(vec![gt]);

        let (proposals, losses) = rpn.forward_t(&images, &features, Some(&gt), true)?;
        assert_eq!(
            losses.keys().collect::<Vec<_>>(),
            vec!["loss_rpn_cls", "loss_rpn_loc"]
        );
        assert!(losses.values().all(|loss| loss.all_finite()));
        assert_eq!(proposals.len(), 1);
        assert!(proposals[0].len() <= 16);

        assert!(rpn.forward_t(&images, &features, None, true).is_err());
        let (_, losses) = rpn.forward_t(&images, &features, None, false)?;
        assert!(losses.is_empty());
        Ok(())
    }

    #[test]
    fn top_proposals_are_sorted_and_clipped() -> Result<()> {
        let proposals = Tensor::of_slice(&[
            0.0f32, 0.0, 10.0, 10.0, //
            0.5, 0.5, 10.5, 10.5, //
            -5.0, 20.0, 40.0, 30.0, //
            5.0, 5.0, 5.5, 5.5,
        ])
        .view([1, 4, 4]);
        let logits = Tensor::of_slice(&[0.5f32, 0.9, 0.1, 2.0]).view([1, 4]);
        let image_sizes = [ImageSize::new_size(32, 32)?];

        let result = find_top_proposals(
            &[proposals],
            &[logits],
            &image_sizes,
            0.7,
            1000,
            100,
            1.0,
            false,
        )?;
        let boxes = result[0].get_boxes("proposal_boxes")?.tensor().shallow_clone();
        let scores = Vec::<f32>::from(result[0].get_tensor("objectness_logits")?);

        // the tiny box is dropped and the second box suppresses the first
        assert_eq!(scores, vec![0.9, 0.1]);
        assert_eq!(Vec::<f32>::from(&boxes.get(1)), vec![0.0, 20.0, 32.0, 30.0]);
        Ok(())
    }

    #[test]
    fn non_finite_candidates() -> Result<()> {
        let proposals = Tensor::of_slice(&[
            0.0f32,
            0.0,
            10.0,
            10.0,
            f32::NAN,
            0.0,
            1.0,
            1.0,
        ])
        .view([1, 2, 4]);
        let logits = Tensor::of_slice(&[0.5f32, 0.9]).view([1, 2]);
        let image_sizes = [ImageSize::new_size(32, 32)?];
        let run = |train| {
            find_top_proposals(
                &[proposals.shallow_clone()],
                &[logits.shallow_clone()],
                &image_sizes,
                0.7,
                10,
                10,
                0.0,
                train,
            )
        };
        assert!(run(true).is_err());
        assert_eq!(run(false)?[0].len(), 1);
        Ok(())
    }
}
