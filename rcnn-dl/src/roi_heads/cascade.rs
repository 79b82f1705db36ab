//! Box refinement over several stages with rising IoU thresholds.

use super::{
    base::{pooler_scales, select_features, ProposalLabeler},
    box_head::FastRcnnConvFcHead,
    fast_rcnn::{BoxPredictions, FastRcnnOutputLayers, FastRcnnOutputLayersInit},
    pooler::{RoiPooler, RoiPoolerInit},
    standard::InstanceBranches,
    RoiHeadsInit,
};
use crate::{
    box_transform::{default_scale_clamp, BoxTransform},
    common::*,
    matcher::{Matcher, MatcherInit},
    structures::{Instances, InstancesList, ShapeSpec},
};

/// The `MODEL.ROI_BOX_CASCADE_HEAD` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeHeadConfig {
    /// Box regression weights of each stage.
    pub bbox_reg_weights: Vec<Vec<R64>>,
    /// Foreground IoU threshold of each stage.
    pub ious: Vec<R64>,
}

impl Default for CascadeHeadConfig {
    fn default() -> Self {
        let weights = |values: [f64; 4]| values.iter().cloned().map(r64).collect::<Vec<_>>();
        Self {
            bbox_reg_weights: vec![
                weights([10.0, 10.0, 5.0, 5.0]),
                weights([20.0, 20.0, 10.0, 10.0]),
                weights([30.0, 30.0, 15.0, 15.0]),
            ],
            ious: vec![r64(0.5), r64(0.6), r64(0.7)],
        }
    }
}

#[derive(Debug)]
struct CascadeStage {
    head: FastRcnnConvFcHead,
    predictor: FastRcnnOutputLayers,
    matcher: Matcher,
}

/// Predictions of one stage with the proposals they were made on.
#[derive(Debug)]
pub struct CascadeStageOutput {
    pub predictions: BoxPredictions,
    pub proposals: InstancesList,
}

#[derive(Debug)]
pub struct CascadeRoiHeads {
    labeler: ProposalLabeler,
    in_features: Vec<String>,
    box_pooler: RoiPooler,
    stages: Vec<CascadeStage>,
    branches: InstanceBranches,
}

impl CascadeRoiHeads {
    pub fn new<'p>(
        path: impl Borrow<nn::Path<'p>>,
        init: &RoiHeadsInit,
        input_shapes: &IndexMap<String, ShapeSpec>,
    ) -> Result<Self> {
        let path = path.borrow();
        let RoiHeadsInit {
            roi_heads,
            box_head: box_config,
            cascade,
            detections_per_image,
            ..
        } = init;
        let CascadeHeadConfig {
            bbox_reg_weights,
            ious,
        } = cascade;

        ensure!(!ious.is_empty(), "at least one cascade stage is required");
        ensure!(
            ious.len() == bbox_reg_weights.len(),
            "{} cascade IoUs do not match {} sets of regression weights",
            ious.len(),
            bbox_reg_weights.len()
        );
        ensure!(
            box_config.cls_agnostic_bbox_reg,
            "cascade ROI heads only support class-agnostic box regression"
        );
        ensure!(
            roi_heads.iou_thresholds.first() == ious.first(),
            "the first cascade IoU {} must equal the proposal matching threshold {:?}",
            ious[0],
            roi_heads.iou_thresholds.first()
        );

        let labeler = ProposalLabeler::new(roi_heads)?;
        let (scales, in_channels) = pooler_scales(input_shapes, &roi_heads.in_features)?;
        let box_pooler = RoiPoolerInit::new(
            box_config.pooler_type,
            box_config.pooler_resolution,
            scales,
            box_config.pooler_sampling_ratio,
        )
        .build()?;
        let pooled_shape = ShapeSpec {
            channels: Some(in_channels),
            height: Some(box_config.pooler_resolution),
            width: Some(box_config.pooler_resolution),
            stride: None,
        };

        let stages: Vec<_> = izip!(ious, bbox_reg_weights)
            .enumerate()
            .map(|(index, (&iou, weights))| -> Result<_> {
                let head = FastRcnnConvFcHead::new(
                    path / format!("box_head_stage{}", index),
                    box_config,
                    pooled_shape,
                )?;
                let predictor = FastRcnnOutputLayersInit {
                    num_classes: roi_heads.num_classes,
                    cls_agnostic_bbox_reg: true,
                    box_transform: BoxTransform::new(weights, default_scale_clamp())?,
                    smooth_l1_beta: box_config.smooth_l1_beta.raw(),
                    test_score_thresh: roi_heads.score_thresh_test.raw(),
                    test_nms_thresh: roi_heads.nms_thresh_test.raw(),
                    test_topk_per_image: *detections_per_image,
                }
                .build(path / format!("box_predictor_stage{}", index), head.output_shape())?;
                let matcher = MatcherInit {
                    thresholds: vec![iou],
                    labels: vec![0, 1],
                    allow_low_quality_matches: false,
                }
                .build()?;
                Ok(CascadeStage {
                    head,
                    predictor,
                    matcher,
                })
            })
            .try_collect()?;

        let branches = InstanceBranches::new(path, init, input_shapes)?;

        Ok(Self {
            labeler,
            in_features: roi_heads.in_features.clone(),
            box_pooler,
            stages,
            branches,
        })
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn forward_t(
        &self,
        features: &FeatureMap,
        proposals: &InstancesList,
        targets: Option<&InstancesList>,
        train: bool,
    ) -> Result<(InstancesList, LossDict)> {
        if train {
            let targets = targets.ok_or_else(|| format_err!("targets are required in training"))?;
            let proposals = self.labeler.label_and_sample_proposals(proposals, targets)?;
            let outputs = self.forward_stages(features, &proposals, Some(targets), true)?;

            let mut losses = LossDict::new();
            for (index, (stage, output)) in izip!(&self.stages, &outputs).enumerate() {
                let stage_losses = stage.predictor.losses(&output.predictions, &output.proposals)?;
                losses.extend(
                    stage_losses
                        .into_iter()
                        .map(|(name, loss)| (format!("{}_stage{}", name, index), loss)),
                );
            }

            let features = select_features(features, &self.in_features)?;
            losses.extend(self.branches.losses(&features, &proposals)?);
            Ok((proposals, losses))
        } else {
            let outputs = self.forward_stages(features, proposals, None, false)?;
            let instances = self.inference(&outputs)?;
            let features = select_features(features, &self.in_features)?;
            let instances = self.branches.forward_with_given_boxes(&features, instances)?;
            Ok((instances, LossDict::new()))
        }
    }

    /// Run every stage, each on the boxes predicted by the previous one.
    ///
    /// With `targets`, the proposals of later stages are matched again with the
    /// stage's own IoU threshold.
    pub fn forward_stages(
        &self,
        features: &FeatureMap,
        proposals: &InstancesList,
        targets: Option<&InstancesList>,
        train: bool,
    ) -> Result<Vec<CascadeStageOutput>> {
        let features = select_features(features, &self.in_features)?;
        let image_sizes = proposals.image_sizes();
        let mut outputs: Vec<CascadeStageOutput> = vec![];

        for (index, stage) in self.stages.iter().enumerate() {
            let proposals = match outputs.last() {
                None => proposals.shallow_clone(),
                Some(prev) => {
                    let prev_stage = &self.stages[index - 1];
                    let boxes = tch::no_grad(|| {
                        prev_stage
                            .predictor
                            .predict_boxes(&prev.predictions, &prev.proposals)
                    })?;
                    let proposals = create_proposals_from_boxes(boxes, &image_sizes, train)?;
                    match targets {
                        Some(targets) => self.match_and_label_boxes(proposals, index, targets)?,
                        None => proposals,
                    }
                }
            };

            let boxes = proposals.get_boxes_vec("proposal_boxes")?;
            let box_features = self.box_pooler.forward(&features, &boxes)?;
            let box_features = scale_gradient(&box_features, 1.0 / self.stages.len() as f64);
            let box_features = stage.head.forward_t(&box_features, train);
            let predictions = stage.predictor.forward(&box_features);
            outputs.push(CascadeStageOutput {
                predictions,
                proposals,
            });
        }
        Ok(outputs)
    }

    /// Decoded boxes of a stage's output, one tensor per image.
    pub fn predict_boxes(&self, stage: usize, output: &CascadeStageOutput) -> Result<Vec<Tensor>> {
        let stage = self
            .stages
            .get(stage)
            .ok_or_else(|| format_err!("stage {} does not exist", stage))?;
        stage
            .predictor
            .predict_boxes(&output.predictions, &output.proposals)
    }

    /// Detections from the stage-averaged class probabilities and the last stage's boxes.
    fn inference(&self, outputs: &[CascadeStageOutput]) -> Result<InstancesList> {
        let (last_stage, last_output) = match (self.stages.last(), outputs.last()) {
            (Some(stage), Some(output)) => (stage, output),
            _ => bail!("no cascade stage output"),
        };

        let scores_per_stage: Vec<Vec<Tensor>> = izip!(&self.stages, outputs)
            .map(|(stage, output)| stage.predictor.predict_probs(&output.predictions, &output.proposals))
            .try_collect()?;
        let num_images = last_output.proposals.len();
        let scores: Vec<_> = (0..num_images)
            .map(|image| Tensor::f_mean_tensors(scores_per_stage.iter().map(|scores| &scores[image])))
            .try_collect()?;

        let boxes = last_stage
            .predictor
            .predict_boxes(&last_output.predictions, &last_output.proposals)?;
        let (instances, _) = last_stage.predictor.inference_with(
            &boxes,
            &scores,
            &last_output.proposals.image_sizes(),
        )?;
        Ok(instances)
    }

    /// Label refined proposals against ground truth with the stage's matcher.
    fn match_and_label_boxes(
        &self,
        proposals: InstancesList,
        stage: usize,
        targets: &InstancesList,
    ) -> Result<InstancesList> {
        let matcher = &self.stages[stage].matcher;
        let num_classes = self.labeler.num_classes();
        let mut num_fg_samples = vec![];
        let mut num_bg_samples = vec![];

        let labeled: Vec<_> = tch::no_grad(|| {
            izip!(proposals, targets.iter())
                .map(|(mut proposals, targets)| -> Result<_> {
                    let proposal_boxes = proposals.get_boxes("proposal_boxes")?;
                    let device = proposal_boxes.device();
                    let num_proposals = proposal_boxes.len();

                    let (gt_classes, gt_boxes, num_fg) = if !targets.is_empty() {
                        let gt_boxes = targets.get_boxes("gt_boxes")?;
                        let quality = BoxTensor::pairwise_iou(gt_boxes, proposal_boxes)?;
                        let (matched_idxs, matched_labels) = matcher.forward(&quality)?;
                        let gt_classes = targets
                            .get_tensor("gt_classes")?
                            .to_device(device)
                            .index_select(0, &matched_idxs)
                            .masked_fill(&matched_labels.eq(0i64), num_classes);
                        let gt_boxes = gt_boxes.f_index(&matched_idxs)?;
                        (gt_classes, gt_boxes, matched_labels.eq(1i64).count_true())
                    } else {
                        let gt_classes = Tensor::full(&[num_proposals], num_classes, (Kind::Int64, device));
                        let gt_boxes = BoxTensor::new(Tensor::zeros(
                            &[num_proposals, proposal_boxes.box_dim()],
                            (Kind::Float, device),
                        ))?;
                        (gt_classes, gt_boxes, 0)
                    };

                    num_fg_samples.push(num_fg);
                    num_bg_samples.push(num_proposals - num_fg);
                    proposals.set("gt_classes", gt_classes)?;
                    proposals.set("gt_boxes", gt_boxes)?;
                    Ok(proposals)
                })
                .try_collect()
        })?;

        let mean = |counts: &[i64]| counts.iter().sum::<i64>() as f64 / counts.len().max(1) as f64;
        debug!("stage{}/roi_head/num_fg_samples: {}", stage, mean(&num_fg_samples));
        debug!("stage{}/roi_head/num_bg_samples: {}", stage, mean(&num_bg_samples));
        Ok(InstancesList::new(labeled))
    }
}

/// Wrap predicted boxes as proposals clipped to their images.
///
/// Empty boxes are dropped in training only.
pub fn create_proposals_from_boxes(
    boxes: Vec<Tensor>,
    image_sizes: &[ImageSize],
    train: bool,
) -> Result<InstancesList> {
    ensure!(
        boxes.len() == image_sizes.len(),
        "expect boxes of {} images, but get {}",
        image_sizes.len(),
        boxes.len()
    );
    izip!(boxes, image_sizes)
        .map(|(boxes, image_size)| {
            let boxes = BoxTensor::new(boxes.detach())?.clip(image_size)?;
            let boxes = if train {
                boxes.f_index(&boxes.nonempty(0.0))?
            } else {
                boxes
            };
            Instances::new(*image_size).with("proposal_boxes", boxes)
        })
        .try_collect()
}
