use super::{
    base::{
        pooler_scales, replace_proposal_boxes, select_features, select_foreground_proposals,
        select_proposals_with_visible_keypoints, ProposalLabeler,
    },
    box_head::FastRcnnConvFcHead,
    fast_rcnn::{FastRcnnOutputLayers, FastRcnnOutputLayersInit},
    keypoint_head::{keypoint_rcnn_inference, KeypointHeadConfig, KrcnnConvDeconvUpsampleHead},
    mask_head::{mask_rcnn_inference, mask_rcnn_loss, MaskHeadConfig, MaskRcnnConvUpsampleHead},
    pooler::{RoiPooler, RoiPoolerInit},
    RoiHeadsInit,
};
use crate::{
    box_transform::{default_scale_clamp, BoxTransform},
    common::*,
    structures::{InstancesList, ShapeSpec},
};

/// Pooler and head of the mask branch.
#[derive(Debug)]
pub(super) struct MaskBranch {
    pooler: RoiPooler,
    head: MaskRcnnConvUpsampleHead,
}

impl MaskBranch {
    pub fn new<'p>(
        path: impl Borrow<nn::Path<'p>>,
        config: &MaskHeadConfig,
        num_classes: i64,
        scales: Vec<f64>,
        in_channels: i64,
    ) -> Result<Self> {
        let pooler = RoiPoolerInit::new(
            config.pooler_type,
            config.pooler_resolution,
            scales,
            config.pooler_sampling_ratio,
        )
        .build()?;
        let head = MaskRcnnConvUpsampleHead::new(
            path,
            config,
            num_classes,
            ShapeSpec {
                channels: Some(in_channels),
                height: Some(config.pooler_resolution),
                width: Some(config.pooler_resolution),
                stride: None,
            },
        )?;
        Ok(Self { pooler, head })
    }

    fn logits(&self, features: &[Tensor], instances: &InstancesList, box_field: &str, train: bool) -> Result<Tensor> {
        let boxes = instances.get_boxes_vec(box_field)?;
        let features = self.pooler.forward(features, &boxes)?;
        Ok(self.head.forward_t(&features, train))
    }
}

/// Pooler and head of the keypoint branch.
#[derive(Debug)]
pub(super) struct KeypointBranch {
    pooler: RoiPooler,
    head: KrcnnConvDeconvUpsampleHead,
}

impl KeypointBranch {
    pub fn new<'p>(
        path: impl Borrow<nn::Path<'p>>,
        config: &KeypointHeadConfig,
        scales: Vec<f64>,
        in_channels: i64,
        batch_size_per_image: i64,
        positive_fraction: f64,
    ) -> Result<Self> {
        let pooler = RoiPoolerInit::new(
            config.pooler_type,
            config.pooler_resolution,
            scales,
            config.pooler_sampling_ratio,
        )
        .build()?;
        let head = KrcnnConvDeconvUpsampleHead::new(
            path,
            config,
            ShapeSpec {
                channels: Some(in_channels),
                height: Some(config.pooler_resolution),
                width: Some(config.pooler_resolution),
                stride: None,
            },
            batch_size_per_image,
            positive_fraction,
        )?;
        Ok(Self { pooler, head })
    }

    fn logits(&self, features: &[Tensor], instances: &InstancesList, box_field: &str, train: bool) -> Result<Tensor> {
        let boxes = instances.get_boxes_vec(box_field)?;
        let features = self.pooler.forward(features, &boxes)?;
        Ok(self.head.forward_t(&features, train))
    }
}

/// The optional mask and keypoint branches run on top of the box predictions.
#[derive(Debug)]
pub(super) struct InstanceBranches {
    pub mask: Option<MaskBranch>,
    pub keypoint: Option<KeypointBranch>,
    pub num_classes: i64,
}

impl InstanceBranches {
    pub fn new<'p>(
        path: impl Borrow<nn::Path<'p>>,
        init: &RoiHeadsInit,
        input_shapes: &IndexMap<String, ShapeSpec>,
    ) -> Result<Self> {
        let path = path.borrow();
        let RoiHeadsInit {
            roi_heads,
            mask_head,
            keypoint_head,
            ..
        } = init;

        let mask = mask_head
            .as_ref()
            .map(|config| -> Result<_> {
                let (scales, in_channels) = pooler_scales(input_shapes, &roi_heads.in_features)?;
                MaskBranch::new(path / "mask_head", config, roi_heads.num_classes, scales, in_channels)
            })
            .transpose()?;
        let keypoint = keypoint_head
            .as_ref()
            .map(|config| -> Result<_> {
                let (scales, in_channels) = pooler_scales(input_shapes, &roi_heads.in_features)?;
                KeypointBranch::new(
                    path / "keypoint_head",
                    config,
                    scales,
                    in_channels,
                    roi_heads.batch_size_per_image,
                    roi_heads.positive_fraction.raw(),
                )
            })
            .transpose()?;

        Ok(Self {
            mask,
            keypoint,
            num_classes: roi_heads.num_classes,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.mask.is_none() && self.keypoint.is_none()
    }

    /// `loss_mask` and `loss_keypoint` over the foreground of sampled proposals.
    pub fn losses(&self, features: &[Tensor], proposals: &InstancesList) -> Result<LossDict> {
        let mut losses = LossDict::new();
        if self.is_empty() {
            return Ok(losses);
        }
        let (fg_proposals, _) = select_foreground_proposals(proposals, self.num_classes)?;

        if let Some(mask) = &self.mask {
            let logits = mask.logits(features, &fg_proposals, "proposal_boxes", true)?;
            losses.insert("loss_mask".into(), mask_rcnn_loss(&logits, &fg_proposals)?);
        }
        if let Some(keypoint) = &self.keypoint {
            let proposals = select_proposals_with_visible_keypoints(&fg_proposals)?;
            let logits = keypoint.logits(features, &proposals, "proposal_boxes", true)?;
            losses.insert("loss_keypoint".into(), keypoint.head.loss(&logits, &proposals)?);
        }
        Ok(losses)
    }

    /// Attach mask and keypoint predictions to detections with `pred_boxes` and `pred_classes`.
    pub fn forward_with_given_boxes(
        &self,
        features: &[Tensor],
        instances: InstancesList,
    ) -> Result<InstancesList> {
        ensure!(
            instances
                .iter()
                .all(|instances| instances.has("pred_boxes") && instances.has("pred_classes")),
            "detections must carry pred_boxes and pred_classes"
        );
        let instances = match &self.mask {
            Some(mask) => {
                let logits = mask.logits(features, &instances, "pred_boxes", false)?;
                mask_rcnn_inference(&logits, instances)?
            }
            None => instances,
        };
        let instances = match &self.keypoint {
            Some(keypoint) => {
                let logits = keypoint.logits(features, &instances, "pred_boxes", false)?;
                keypoint_rcnn_inference(&logits, instances)?
            }
            None => instances,
        };
        Ok(instances)
    }
}

/// Pool proposal features, run the box head and predictor, then the mask and
/// keypoint branches, each with its own pooler.
#[derive(Debug)]
pub struct StandardRoiHeads {
    labeler: ProposalLabeler,
    in_features: Vec<String>,
    box_pooler: RoiPooler,
    box_head: FastRcnnConvFcHead,
    box_predictor: FastRcnnOutputLayers,
    branches: InstanceBranches,
    train_on_pred_boxes: bool,
}

impl StandardRoiHeads {
    pub fn new<'p>(
        path: impl Borrow<nn::Path<'p>>,
        init: &RoiHeadsInit,
        input_shapes: &IndexMap<String, ShapeSpec>,
    ) -> Result<Self> {
        let path = path.borrow();
        let RoiHeadsInit {
            roi_heads,
            box_head: box_config,
            detections_per_image,
            ..
        } = init;
        ensure!(!roi_heads.in_features.is_empty(), "ROI heads require at least one input feature");

        let labeler = ProposalLabeler::new(roi_heads)?;
        let (scales, in_channels) = pooler_scales(input_shapes, &roi_heads.in_features)?;
        let box_pooler = RoiPoolerInit::new(
            box_config.pooler_type,
            box_config.pooler_resolution,
            scales,
            box_config.pooler_sampling_ratio,
        )
        .build()?;
        let box_head = FastRcnnConvFcHead::new(
            path / "box_head",
            box_config,
            ShapeSpec {
                channels: Some(in_channels),
                height: Some(box_config.pooler_resolution),
                width: Some(box_config.pooler_resolution),
                stride: None,
            },
        )?;
        let box_transform = BoxTransform::new(&box_config.bbox_reg_weights, default_scale_clamp())?;
        ensure!(
            box_transform.box_dim() == box_pooler.pooler_type().box_dim(),
            "{:?} does not pool {}-d boxes",
            box_pooler.pooler_type(),
            box_transform.box_dim()
        );
        let box_predictor = FastRcnnOutputLayersInit {
            num_classes: roi_heads.num_classes,
            cls_agnostic_bbox_reg: box_config.cls_agnostic_bbox_reg,
            box_transform,
            smooth_l1_beta: box_config.smooth_l1_beta.raw(),
            test_score_thresh: roi_heads.score_thresh_test.raw(),
            test_nms_thresh: roi_heads.nms_thresh_test.raw(),
            test_topk_per_image: *detections_per_image,
        }
        .build(path / "box_predictor", box_head.output_shape())?;
        let branches = InstanceBranches::new(path, init, input_shapes)?;

        Ok(Self {
            labeler,
            in_features: roi_heads.in_features.clone(),
            box_pooler,
            box_head,
            box_predictor,
            branches,
            train_on_pred_boxes: box_config.train_on_pred_boxes,
        })
    }

    pub fn box_dim(&self) -> i64 {
        self.box_pooler.pooler_type().box_dim()
    }

    pub fn has_instance_branches(&self) -> bool {
        !self.branches.is_empty()
    }

    pub fn train_on_pred_boxes(&self) -> bool {
        self.train_on_pred_boxes
    }

    /// Run on RPN proposals.
    ///
    /// Training samples proposals against `targets` and returns them with the
    /// losses. Inference returns detections with an empty loss dict.
    pub fn forward_t(
        &self,
        features: &FeatureMap,
        proposals: &InstancesList,
        targets: Option<&InstancesList>,
        train: bool,
    ) -> Result<(InstancesList, LossDict)> {
        let features = select_features(features, &self.in_features)?;

        if train {
            let targets = targets.ok_or_else(|| format_err!("targets are required in training"))?;
            let proposals = self.labeler.label_and_sample_proposals(proposals, targets)?;
            let (mut losses, proposals) = self.forward_box_train(&features, proposals)?;
            losses.extend(self.branches.losses(&features, &proposals)?);
            Ok((proposals, losses))
        } else {
            let (instances, _) = self.forward_box_inference(&features, proposals)?;
            let instances = self.branches.forward_with_given_boxes(&features, instances)?;
            Ok((instances, LossDict::new()))
        }
    }

    /// Attach mask and keypoint predictions to given detections.
    pub fn forward_with_given_boxes(
        &self,
        features: &FeatureMap,
        instances: InstancesList,
    ) -> Result<InstancesList> {
        let features = select_features(features, &self.in_features)?;
        self.branches.forward_with_given_boxes(&features, instances)
    }

    /// Box losses, with proposal boxes replaced by the refined ones if training on predicted boxes.
    fn forward_box_train(
        &self,
        features: &[Tensor],
        proposals: InstancesList,
    ) -> Result<(LossDict, InstancesList)> {
        let boxes = proposals.get_boxes_vec("proposal_boxes")?;
        let box_features = self.box_pooler.forward(features, &boxes)?;
        let box_features = self.box_head.forward_t(&box_features, true);
        let predictions = self.box_predictor.forward(&box_features);
        let losses = self.box_predictor.losses(&predictions, &proposals)?;

        let proposals = if self.train_on_pred_boxes {
            let pred_boxes = tch::no_grad(|| {
                self.box_predictor
                    .predict_boxes_for_gt_classes(&predictions, &proposals)
            })?;
            replace_proposal_boxes(proposals, pred_boxes)?
        } else {
            proposals
        };
        Ok((losses, proposals))
    }

    fn forward_box_inference(
        &self,
        features: &[Tensor],
        proposals: &InstancesList,
    ) -> Result<(InstancesList, Vec<Tensor>)> {
        let boxes = proposals.get_boxes_vec("proposal_boxes")?;
        let box_features = self.box_pooler.forward(features, &boxes)?;
        let box_features = self.box_head.forward_t(&box_features, false);
        let predictions = self.box_predictor.forward(&box_features);
        self.box_predictor.inference(&predictions, proposals)
    }
}
