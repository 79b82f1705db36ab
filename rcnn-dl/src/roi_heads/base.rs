//! Proposal matching and sampling shared by every ROI heads variant.

use crate::{
    common::*,
    matcher::{Matcher, MatcherInit},
    sampling::subsample_labels,
    structures::{shared_channels, Instances, InstancesList, ShapeSpec},
};

/// Objectness logit assigned to ground truth boxes appended to the proposals,
/// the logit of a probability of `1 - 1e-10`.
pub const GT_PROPOSAL_LOGIT: f64 = 23.025850929840455;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoiHeadsKind {
    #[serde(rename = "StandardROIHeads")]
    Standard,
    #[serde(rename = "CascadeROIHeads")]
    Cascade,
    #[serde(rename = "Res5ROIHeads")]
    Res5,
    #[serde(rename = "RROIHeads")]
    Rotated,
}

/// The `MODEL.ROI_HEADS` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiHeadsConfig {
    pub name: RoiHeadsKind,
    pub num_classes: i64,
    pub in_features: Vec<String>,
    pub iou_thresholds: Vec<R64>,
    pub iou_labels: Vec<i64>,
    pub batch_size_per_image: i64,
    pub positive_fraction: R64,
    pub score_thresh_test: R64,
    pub nms_thresh_test: R64,
    pub proposal_append_gt: bool,
}

impl Default for RoiHeadsConfig {
    fn default() -> Self {
        Self {
            name: RoiHeadsKind::Res5,
            num_classes: 80,
            in_features: vec!["res4".into()],
            iou_thresholds: vec![r64(0.5)],
            iou_labels: vec![0, 1],
            batch_size_per_image: 512,
            positive_fraction: r64(0.25),
            score_thresh_test: r64(0.05),
            nms_thresh_test: r64(0.5),
            proposal_append_gt: true,
        }
    }
}

/// Matches proposals against ground truth and samples a balanced training set.
#[derive(Debug, CopyGetters)]
pub struct ProposalLabeler {
    matcher: Matcher,
    #[get_copy = "pub"]
    num_classes: i64,
    #[get_copy = "pub"]
    batch_size_per_image: i64,
    #[get_copy = "pub"]
    positive_fraction: f64,
    #[get_copy = "pub"]
    proposal_append_gt: bool,
}

impl ProposalLabeler {
    pub fn new(config: &RoiHeadsConfig) -> Result<Self> {
        let RoiHeadsConfig {
            num_classes,
            ref iou_thresholds,
            ref iou_labels,
            batch_size_per_image,
            positive_fraction,
            proposal_append_gt,
            ..
        } = *config;
        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(batch_size_per_image > 0, "batch_size_per_image must be positive");

        let matcher = MatcherInit {
            thresholds: iou_thresholds.clone(),
            labels: iou_labels.clone(),
            allow_low_quality_matches: false,
        }
        .build()?;

        Ok(Self {
            matcher,
            num_classes,
            batch_size_per_image,
            positive_fraction: positive_fraction.raw(),
            proposal_append_gt,
        })
    }

    /// Sample proposals for training and attach their ground truth.
    ///
    /// Each sampled proposal gets `gt_classes`, with `num_classes` marking the
    /// background, and every `gt_*` field of its matched target. Images without
    /// ground truth get zero `gt_boxes`.
    pub fn label_and_sample_proposals(
        &self,
        proposals: &InstancesList,
        targets: &InstancesList,
    ) -> Result<InstancesList> {
        ensure!(
            proposals.len() == targets.len(),
            "expect targets of {} images, but get {}",
            proposals.len(),
            targets.len()
        );

        tch::no_grad(|| {
            let proposals = if self.proposal_append_gt {
                add_ground_truth_to_proposals(targets, proposals)?
            } else {
                proposals.shallow_clone()
            };

            let mut num_fg_samples = vec![];
            let mut num_bg_samples = vec![];

            let sampled: Vec<_> = izip!(proposals.iter(), targets.iter())
                .map(|(proposals, targets)| -> Result<_> {
                    let proposal_boxes = proposals.get_boxes("proposal_boxes")?;
                    let device = proposal_boxes.device();
                    let has_gt = !targets.is_empty();

                    let (matched_idxs, matched_labels, gt_classes) = if has_gt {
                        let gt_boxes = targets.get_boxes("gt_boxes")?;
                        let quality = BoxTensor::pairwise_iou(gt_boxes, proposal_boxes)?;
                        let (matched_idxs, matched_labels) = self.matcher.forward(&quality)?;
                        let gt_classes = targets.get_tensor("gt_classes")?.to_device(device);
                        (matched_idxs, matched_labels, Some(gt_classes))
                    } else {
                        let quality = Tensor::zeros(&[0, proposal_boxes.len()], (Kind::Float, device));
                        let (matched_idxs, matched_labels) = self.matcher.forward(&quality)?;
                        (matched_idxs, matched_labels, None)
                    };

                    let (sampled_idxs, sampled_gt_classes) = self.sample_proposals(
                        &matched_idxs,
                        &matched_labels,
                        gt_classes.as_ref(),
                    )?;

                    let mut sampled = proposals.f_index(&sampled_idxs)?;
                    sampled.set("gt_classes", sampled_gt_classes.shallow_clone())?;

                    if has_gt {
                        let sampled_targets = matched_idxs.index_select(0, &sampled_idxs);
                        for (name, value) in targets.fields() {
                            if name.starts_with("gt_") && !sampled.has(name) {
                                sampled.set(name.as_str(), value.f_index(&sampled_targets)?)?;
                            }
                        }
                    } else {
                        let gt_boxes = Tensor::zeros(
                            &[sampled_idxs.size()[0], proposal_boxes.box_dim()],
                            (Kind::Float, device),
                        );
                        sampled.set("gt_boxes", BoxTensor::new(gt_boxes)?)?;
                    }

                    let num_bg = sampled_gt_classes.eq(self.num_classes).count_true();
                    num_bg_samples.push(num_bg);
                    num_fg_samples.push(sampled_gt_classes.numel() as i64 - num_bg);
                    Ok(sampled)
                })
                .try_collect()?;

            debug!("roi_head/num_fg_samples: {}", mean(&num_fg_samples));
            debug!("roi_head/num_bg_samples: {}", mean(&num_bg_samples));
            Ok(InstancesList::new(sampled))
        })
    }

    /// Turn matcher output into sampled indices and their class labels.
    fn sample_proposals(
        &self,
        matched_idxs: &Tensor,
        matched_labels: &Tensor,
        gt_classes: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let gt_classes = match gt_classes {
            Some(gt_classes) => gt_classes
                .to_kind(Kind::Int64)
                .index_select(0, matched_idxs)
                .masked_fill(&matched_labels.eq(0i64), self.num_classes)
                .masked_fill(&matched_labels.eq(-1i64), -1i64),
            None => Tensor::full(
                &[matched_idxs.size()[0]],
                self.num_classes,
                (Kind::Int64, matched_idxs.device()),
            ),
        };

        let (fg_idxs, bg_idxs) = subsample_labels(
            &gt_classes,
            self.batch_size_per_image,
            self.positive_fraction,
            self.num_classes,
        )?;
        let sampled_idxs = Tensor::f_cat(&[fg_idxs, bg_idxs], 0)?;
        let sampled_gt_classes = gt_classes.index_select(0, &sampled_idxs);
        Ok((sampled_idxs, sampled_gt_classes))
    }
}

fn mean(counts: &[i64]) -> f64 {
    if counts.is_empty() {
        return 0.0;
    }
    counts.iter().sum::<i64>() as f64 / counts.len() as f64
}

/// Append each image's `gt_boxes` to its proposals with a high objectness logit.
pub fn add_ground_truth_to_proposals(
    targets: &InstancesList,
    proposals: &InstancesList,
) -> Result<InstancesList> {
    ensure!(
        targets.len() == proposals.len(),
        "expect targets of {} images, but get {}",
        proposals.len(),
        targets.len()
    );
    izip!(targets.iter(), proposals.iter())
        .map(|(targets, proposals)| add_ground_truth_to_proposals_single_image(targets, proposals))
        .try_collect()
}

fn add_ground_truth_to_proposals_single_image(
    targets: &Instances,
    proposals: &Instances,
) -> Result<Instances> {
    if !targets.has("gt_boxes") {
        return Ok(proposals.shallow_clone());
    }
    let gt_boxes = targets.get_boxes("gt_boxes")?;
    let logits = proposals.get_tensor("objectness_logits")?;
    let gt_logits = Tensor::full(
        &[gt_boxes.len()],
        GT_PROPOSAL_LOGIT,
        (logits.kind(), logits.device()),
    );
    let gt_proposals = Instances::new(*proposals.image_size())
        .with("proposal_boxes", gt_boxes.to_device(logits.device()))?
        .with("objectness_logits", gt_logits)?;
    Instances::cat(&[proposals.shallow_clone(), gt_proposals])
}

/// Keep proposals labeled with a foreground class.
///
/// Returns the foreground proposals of each image with the boolean masks that
/// selected them.
pub fn select_foreground_proposals(
    proposals: &InstancesList,
    bg_label: i64,
) -> Result<(InstancesList, Vec<Tensor>)> {
    let (fg_proposals, fg_masks): (Vec<_>, Vec<_>) = proposals
        .iter()
        .map(|proposals| -> Result<_> {
            let gt_classes = proposals.get_tensor("gt_classes")?;
            let fg_mask = gt_classes.ne(-1i64).logical_and(&gt_classes.ne(bg_label));
            Ok((proposals.f_index(&fg_mask)?, fg_mask))
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .unzip();
    Ok((InstancesList::new(fg_proposals), fg_masks))
}

/// Keep proposals whose box contains at least one visible ground truth keypoint.
pub fn select_proposals_with_visible_keypoints(proposals: &InstancesList) -> Result<InstancesList> {
    let mut num_selected = vec![];

    let selected: Vec<_> = proposals
        .iter()
        .map(|proposals| -> Result<_> {
            if proposals.is_empty() {
                return Ok(proposals.shallow_clone());
            }
            let keypoints = proposals.get_keypoints("gt_keypoints")?.tensor();
            let boxes = proposals.get_boxes("proposal_boxes")?.tensor().unsqueeze(1);

            let xs = keypoints.select(2, 0);
            let ys = keypoints.select(2, 1);
            let visible = keypoints.select(2, 2).ge(1.0);
            let inside = xs
                .ge_tensor(&boxes.select(2, 0))
                .logical_and(&xs.le_tensor(&boxes.select(2, 2)))
                .logical_and(&ys.ge_tensor(&boxes.select(2, 1)))
                .logical_and(&ys.le_tensor(&boxes.select(2, 3)));
            let selection = inside.logical_and(&visible).any_dim(1, false).nonzero_1d();

            num_selected.push(selection.numel() as i64);
            proposals.f_index(&selection)
        })
        .try_collect()?;

    debug!("keypoint_head/num_fg_samples: {}", mean(&num_selected));
    Ok(InstancesList::new(selected))
}

/// Look up `in_features` in the feature map, in order.
pub fn select_features(features: &FeatureMap, in_features: &[String]) -> Result<Vec<Tensor>> {
    in_features
        .iter()
        .map(|name| {
            features
                .get(name)
                .map(|feature| feature.shallow_clone())
                .ok_or_else(|| format_err!("the feature '{}' does not exist", name))
        })
        .try_collect()
}

/// Pooler scales, the reciprocal strides of `in_features`, with their shared channel count.
pub fn pooler_scales(
    input_shapes: &IndexMap<String, ShapeSpec>,
    in_features: &[String],
) -> Result<(Vec<f64>, i64)> {
    let scales: Vec<f64> = in_features
        .iter()
        .map(|name| -> Result<_> {
            let stride = input_shapes
                .get(name)
                .ok_or_else(|| format_err!("the input feature '{}' does not exist", name))?
                .try_stride()?;
            Ok(1.0 / stride as f64)
        })
        .try_collect()?;
    let in_channels = shared_channels(input_shapes, in_features)?;
    Ok((scales, in_channels))
}

/// Replace `proposal_boxes` of each image by new boxes.
pub fn replace_proposal_boxes(proposals: InstancesList, boxes: Vec<Tensor>) -> Result<InstancesList> {
    ensure!(
        proposals.len() == boxes.len(),
        "expect boxes of {} images, but get {}",
        proposals.len(),
        boxes.len()
    );
    izip!(proposals, boxes)
        .map(|(mut proposals, boxes)| {
            proposals.set("proposal_boxes", BoxTensor::new(boxes)?)?;
            Ok(proposals)
        })
        .collect::<Result<Vec<_>>>()
        .map(InstancesList::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::Keypoints;

    fn config() -> RoiHeadsConfig {
        RoiHeadsConfig {
            num_classes: 3,
            batch_size_per_image: 4,
            positive_fraction: r64(0.5),
            ..Default::default()
        }
    }

    fn proposals(rows: &[[f32; 4]]) -> Result<Instances> {
        let image_size = ImageSize::new_size(64, 64)?;
        Instances::new(image_size)
            .with("proposal_boxes", Boxes::from_xyxy(rows)?)?
            .with(
                "objectness_logits",
                Tensor::zeros(&[rows.len() as i64], (Kind::Float, Device::Cpu)),
            )
    }

    #[test]
    fn pseudo_logit() {
        let prob = 1.0 - 1e-10f64;
        assert_abs_diff_eq!(GT_PROPOSAL_LOGIT, (prob / (1.0 - prob)).ln(), epsilon = 1e-4);
    }

    #[test]
    fn append_ground_truth() -> Result<()> {
        let targets = InstancesList::new(vec![Instances::new(ImageSize::new_size(64, 64)?)
            .with("gt_boxes", Boxes::from_xyxy(&[[1.0, 1.0, 5.0, 5.0]])?)?
            .with("gt_classes", Tensor::of_slice(&[2i64]))?]);
        let proposals = InstancesList::new(vec![proposals(&[[0.0, 0.0, 4.0, 4.0]])?]);

        let merged = add_ground_truth_to_proposals(&targets, &proposals)?;
        assert_eq!(merged[0].len(), 2);
        let logits = Vec::<f32>::from(merged[0].get_tensor("objectness_logits")?);
        assert_abs_diff_eq!(logits[1] as f64, GT_PROPOSAL_LOGIT, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn label_and_sample() -> Result<()> {
        let labeler = ProposalLabeler::new(&RoiHeadsConfig {
            proposal_append_gt: false,
            ..config()
        })?;
        let targets = InstancesList::new(vec![Instances::new(ImageSize::new_size(64, 64)?)
            .with("gt_boxes", Boxes::from_xyxy(&[[0.0, 0.0, 10.0, 10.0]])?)?
            .with("gt_classes", Tensor::of_slice(&[2i64]))?]);
        let proposals = InstancesList::new(vec![proposals(&[
            [0.0, 0.0, 10.0, 10.0],
            [30.0, 30.0, 40.0, 40.0],
            [0.0, 0.0, 9.0, 10.0],
        ])?]);

        let sampled = labeler.label_and_sample_proposals(&proposals, &targets)?;
        let sampled = &sampled[0];
        assert_eq!(sampled.len(), 3);
        // foreground first, then background
        let classes = Vec::<i64>::from(sampled.get_tensor("gt_classes")?);
        assert_eq!(classes, vec![2, 2, 3]);
        assert_eq!(sampled.get_boxes("gt_boxes")?.len(), 3);
        Ok(())
    }

    #[test]
    fn label_without_ground_truth() -> Result<()> {
        let labeler = ProposalLabeler::new(&config())?;
        let targets = InstancesList::new(vec![Instances::new(ImageSize::new_size(64, 64)?)]);
        let proposals = InstancesList::new(vec![proposals(&[
            [0.0, 0.0, 10.0, 10.0],
            [30.0, 30.0, 40.0, 40.0],
        ])?]);

        let sampled = labeler.label_and_sample_proposals(&proposals, &targets)?;
        let classes = Vec::<i64>::from(sampled[0].get_tensor("gt_classes")?);
        assert_eq!(classes, vec![3, 3]);
        let gt_boxes = sampled[0].get_boxes("gt_boxes")?;
        assert_eq!(gt_boxes.tensor().size(), vec![2, 4]);
        assert_eq!(f64::from(gt_boxes.tensor().abs().sum(Kind::Float)), 0.0);
        Ok(())
    }

    #[test]
    fn foreground_and_keypoint_selection() -> Result<()> {
        let keypoints = Tensor::of_slice(&[
            5.0f32, 5.0, 2.0, // inside the first box
            50.0, 50.0, 2.0, // outside the second box
            35.0, 35.0, 0.0, // inside the third box but invisible
        ])
        .view([3, 1, 3]);
        let proposals = proposals(&[
            [0.0, 0.0, 10.0, 10.0],
            [20.0, 20.0, 30.0, 30.0],
            [30.0, 30.0, 40.0, 40.0],
        ])?
        .with("gt_classes", Tensor::of_slice(&[1i64, 0, 3]))?
        .with("gt_keypoints", Keypoints::new(keypoints)?)?;
        let proposals = InstancesList::new(vec![proposals]);

        let (fg, masks) = select_foreground_proposals(&proposals, 3)?;
        assert_eq!(fg[0].len(), 2);
        assert_eq!(Vec::<bool>::from(&masks[0]), vec![true, true, false]);

        let visible = select_proposals_with_visible_keypoints(&fg)?;
        assert_eq!(visible[0].len(), 1);
        assert_eq!(Vec::<i64>::from(visible[0].get_tensor("gt_classes")?), vec![1]);
        Ok(())
    }

    #[test]
    fn missing_feature() {
        let mut features = FeatureMap::new();
        features.insert("p2".into(), Tensor::zeros(&[1, 1, 2, 2], (Kind::Float, Device::Cpu)));
        assert!(select_features(&features, &["p2".into()]).is_ok());
        assert!(select_features(&features, &["p3".into()]).is_err());
    }
}
