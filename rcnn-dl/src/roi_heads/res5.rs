use super::{
    base::{pooler_scales, select_features, select_foreground_proposals, ProposalLabeler},
    fast_rcnn::{FastRcnnOutputLayers, FastRcnnOutputLayersInit},
    mask_head::{mask_rcnn_inference, mask_rcnn_loss, MaskRcnnConvUpsampleHead},
    pooler::{RoiPooler, RoiPoolerInit},
    RoiHeadsInit,
};
use crate::{
    box_transform::{default_scale_clamp, BoxTransform},
    common::*,
    structures::{InstancesList, ShapeSpec},
};

/// The `MODEL.RESNETS` entries that shape the res5 stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResNetsConfig {
    pub num_groups: i64,
    pub width_per_group: i64,
    pub res2_out_channels: i64,
    pub stride_in_1x1: bool,
    pub norm: NormKind,
}

impl Default for ResNetsConfig {
    fn default() -> Self {
        Self {
            num_groups: 1,
            width_per_group: 64,
            res2_out_channels: 256,
            stride_in_1x1: true,
            norm: NormKind::FrozenBatchNorm,
        }
    }
}

/// ROI heads that run the res5 stage on pooled regions of a single feature.
///
/// The box predictor and the mask head share the res5 features.
#[derive(Debug)]
pub struct Res5RoiHeads {
    labeler: ProposalLabeler,
    in_feature: String,
    pooler: RoiPooler,
    res5: Vec<BottleneckBlock>,
    box_predictor: FastRcnnOutputLayers,
    mask_head: Option<MaskRcnnConvUpsampleHead>,
}

impl Res5RoiHeads {
    pub fn new<'p>(
        path: impl Borrow<nn::Path<'p>>,
        init: &RoiHeadsInit,
        input_shapes: &IndexMap<String, ShapeSpec>,
    ) -> Result<Self> {
        let path = path.borrow();
        let RoiHeadsInit {
            roi_heads,
            box_head: box_config,
            mask_head,
            keypoint_head,
            resnets,
            detections_per_image,
            ..
        } = init;
        let ResNetsConfig {
            num_groups,
            width_per_group,
            res2_out_channels,
            stride_in_1x1,
            norm,
        } = *resnets;

        ensure!(
            roi_heads.in_features.len() == 1,
            "res5 ROI heads take exactly one input feature, but get {:?}",
            roi_heads.in_features
        );
        ensure!(keypoint_head.is_none(), "res5 ROI heads have no keypoint branch");

        let labeler = ProposalLabeler::new(roi_heads)?;
        let (scales, _) = pooler_scales(input_shapes, &roi_heads.in_features)?;
        let pooler = RoiPoolerInit::new(
            box_config.pooler_type,
            box_config.pooler_resolution,
            scales,
            box_config.pooler_sampling_ratio,
        )
        .build()?;

        // res5 widens res2 by 2^3
        let stage_channel_factor = 8;
        let out_channels = res2_out_channels * stage_channel_factor;
        let res5 = bottleneck_stage(
            path / "res5",
            BottleneckBlockInit {
                stride: 2,
                num_groups,
                norm,
                stride_in_1x1,
                ..BottleneckBlockInit::new(
                    out_channels / 2,
                    out_channels,
                    num_groups * width_per_group * stage_channel_factor,
                )
            },
            3,
        )?;

        let box_predictor = FastRcnnOutputLayersInit {
            num_classes: roi_heads.num_classes,
            cls_agnostic_bbox_reg: box_config.cls_agnostic_bbox_reg,
            box_transform: BoxTransform::new(&box_config.bbox_reg_weights, default_scale_clamp())?,
            smooth_l1_beta: box_config.smooth_l1_beta.raw(),
            test_score_thresh: roi_heads.score_thresh_test.raw(),
            test_nms_thresh: roi_heads.nms_thresh_test.raw(),
            test_topk_per_image: *detections_per_image,
        }
        .build(
            path / "box_predictor",
            ShapeSpec {
                channels: Some(out_channels),
                height: Some(1),
                width: Some(1),
                stride: None,
            },
        )?;

        let mask_head = mask_head
            .as_ref()
            .map(|config| {
                MaskRcnnConvUpsampleHead::new(
                    path / "mask_head",
                    config,
                    roi_heads.num_classes,
                    ShapeSpec {
                        channels: Some(out_channels),
                        height: Some(box_config.pooler_resolution),
                        width: Some(box_config.pooler_resolution),
                        stride: None,
                    },
                )
            })
            .transpose()?;

        Ok(Self {
            labeler,
            in_feature: roi_heads.in_features[0].clone(),
            pooler,
            res5,
            box_predictor,
            mask_head,
        })
    }

    fn shared_roi_transform(&self, features: &[Tensor], boxes: &[BoxTensor], train: bool) -> Result<Tensor> {
        let pooled = self.pooler.forward(features, boxes)?;
        Ok(self
            .res5
            .iter()
            .fold(pooled, |xs, block| block.forward_t(&xs, train)))
    }

    pub fn forward_t(
        &self,
        features: &FeatureMap,
        proposals: &InstancesList,
        targets: Option<&InstancesList>,
        train: bool,
    ) -> Result<(InstancesList, LossDict)> {
        let features = select_features(features, &[self.in_feature.clone()])?;

        if train {
            let targets = targets.ok_or_else(|| format_err!("targets are required in training"))?;
            let proposals = self.labeler.label_and_sample_proposals(proposals, targets)?;
            let boxes = proposals.get_boxes_vec("proposal_boxes")?;
            let box_features = self.shared_roi_transform(&features, &boxes, true)?;
            let predictions = self
                .box_predictor
                .forward(&box_features.mean_dim(&[2, 3], false, Kind::Float));
            let mut losses = self.box_predictor.losses(&predictions, &proposals)?;

            if let Some(mask_head) = &self.mask_head {
                let (fg_proposals, fg_masks) =
                    select_foreground_proposals(&proposals, self.labeler.num_classes())?;
                let fg_mask = Tensor::f_cat(&fg_masks, 0)?;
                let mask_features = box_features.index(&[Some(fg_mask)]);
                let logits = mask_head.forward_t(&mask_features, true);
                losses.insert("loss_mask".into(), mask_rcnn_loss(&logits, &fg_proposals)?);
            }
            Ok((proposals, losses))
        } else {
            let boxes = proposals.get_boxes_vec("proposal_boxes")?;
            let box_features = self.shared_roi_transform(&features, &boxes, false)?;
            let predictions = self
                .box_predictor
                .forward(&box_features.mean_dim(&[2, 3], false, Kind::Float));
            let (instances, _) = self.box_predictor.inference(&predictions, proposals)?;
            let instances = self.forward_with_features(&features, instances)?;
            Ok((instances, LossDict::new()))
        }
    }

    /// Attach mask predictions to given detections.
    pub fn forward_with_given_boxes(
        &self,
        features: &FeatureMap,
        instances: InstancesList,
    ) -> Result<InstancesList> {
        let features = select_features(features, &[self.in_feature.clone()])?;
        self.forward_with_features(&features, instances)
    }

    fn forward_with_features(&self, features: &[Tensor], instances: InstancesList) -> Result<InstancesList> {
        ensure!(
            instances
                .iter()
                .all(|instances| instances.has("pred_boxes") && instances.has("pred_classes")),
            "detections must carry pred_boxes and pred_classes"
        );
        match &self.mask_head {
            Some(mask_head) => {
                let boxes = instances.get_boxes_vec("pred_boxes")?;
                let features = self.shared_roi_transform(features, &boxes, false)?;
                let logits = mask_head.forward_t(&features, false);
                mask_rcnn_inference(&logits, instances)
            }
            None => Ok(instances),
        }
    }
}
