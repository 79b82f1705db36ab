use super::{standard::StandardRoiHeads, PoolerType, RoiHeadsInit};
use crate::{
    common::*,
    structures::{InstancesList, ShapeSpec},
};

/// Standard ROI heads on rotated proposals.
///
/// Only the box branch is supported.
#[derive(Debug)]
pub struct RotatedRoiHeads(StandardRoiHeads);

impl RotatedRoiHeads {
    pub fn new<'p>(
        path: impl Borrow<nn::Path<'p>>,
        init: &RoiHeadsInit,
        input_shapes: &IndexMap<String, ShapeSpec>,
    ) -> Result<Self> {
        let RoiHeadsInit {
            box_head,
            mask_head,
            keypoint_head,
            ..
        } = init;
        ensure!(mask_head.is_none(), "rotated ROI heads have no mask branch");
        ensure!(keypoint_head.is_none(), "rotated ROI heads have no keypoint branch");
        ensure!(
            !box_head.train_on_pred_boxes,
            "rotated ROI heads cannot train on predicted boxes"
        );
        ensure!(
            box_head.pooler_type == PoolerType::RoiAlignRotated,
            "rotated ROI heads require ROIAlignRotated pooling, but get {:?}",
            box_head.pooler_type
        );

        let heads = StandardRoiHeads::new(path, init, input_shapes)?;
        ensure!(
            heads.box_dim() == RotatedBoxes::BOX_DIM,
            "rotated ROI heads require 5-d boxes"
        );
        Ok(Self(heads))
    }

    pub fn forward_t(
        &self,
        features: &FeatureMap,
        proposals: &InstancesList,
        targets: Option<&InstancesList>,
        train: bool,
    ) -> Result<(InstancesList, LossDict)> {
        self.0.forward_t(features, proposals, targets, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        roi_heads::{BoxHeadConfig, MaskHeadConfig, RoiHeadsConfig, RoiHeadsKind},
        structures::Instances,
    };

    fn init() -> RoiHeadsInit {
        RoiHeadsInit {
            roi_heads: RoiHeadsConfig {
                name: RoiHeadsKind::Rotated,
                num_classes: 2,
                in_features: vec!["p3".into()],
                batch_size_per_image: 8,
                ..Default::default()
            },
            box_head: BoxHeadConfig {
                pooler_type: PoolerType::RoiAlignRotated,
                pooler_resolution: 4,
                num_fc: 1,
                fc_dim: 16,
                bbox_reg_weights: vec![r64(10.0), r64(10.0), r64(5.0), r64(5.0), r64(1.0)],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn shapes() -> IndexMap<String, ShapeSpec> {
        vec![("p3".to_string(), ShapeSpec::new(8, 8))].into_iter().collect()
    }

    #[test]
    fn rejects_unsupported_branches() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let with_mask = RoiHeadsInit {
            mask_head: Some(MaskHeadConfig::default()),
            ..init()
        };
        assert!(RotatedRoiHeads::new(&vs.root(), &with_mask, &shapes()).is_err());

        let mut axis_aligned = init();
        axis_aligned.box_head.pooler_type = PoolerType::RoiAlignV2;
        assert!(RotatedRoiHeads::new(&vs.root(), &axis_aligned, &shapes()).is_err());

        let mut four_weights = init();
        four_weights.box_head.bbox_reg_weights.pop();
        assert!(RotatedRoiHeads::new(&vs.root(), &four_weights, &shapes()).is_err());
        Ok(())
    }

    #[test]
    fn train_and_infer() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let heads = RotatedRoiHeads::new(&vs.root() / "roi_heads", &init(), &shapes())?;
        let mut features = FeatureMap::new();
        features.insert("p3".into(), Tensor::randn(&[1, 8, 8, 8], (Kind::Float, Device::Cpu)));

        let image_size = ImageSize::new_size(64, 64)?;
        let proposals = InstancesList::new(vec![Instances::new(image_size)
            .with(
                "proposal_boxes",
                RotatedBoxes::from_cxcywha(&[[16.0, 16.0, 20.0, 10.0, 30.0], [44.0, 44.0, 12.0, 12.0, 0.0]])?,
            )?
            .with("objectness_logits", Tensor::of_slice(&[1.0f32, 0.0]))?]);
        let targets = InstancesList::new(vec![Instances::new(image_size)
            .with("gt_boxes", RotatedBoxes::from_cxcywha(&[[16.0, 16.0, 20.0, 10.0, 30.0]])?)?
            .with("gt_classes", Tensor::of_slice(&[0i64]))?]);

        let (sampled, losses) = heads.forward_t(&features, &proposals, Some(&targets), true)?;
        assert_eq!(sampled[0].get_boxes("proposal_boxes")?.box_dim(), 5);
        assert!(losses.values().all(|loss| loss.all_finite()));

        let (instances, _) = heads.forward_t(&features, &proposals, None, false)?;
        assert_eq!(instances[0].get_boxes("pred_boxes")?.box_dim(), 5);
        Ok(())
    }
}
