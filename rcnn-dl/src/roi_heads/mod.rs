//! Second-stage heads that classify and refine proposals.

mod base;
mod box_head;
mod cascade;
mod fast_rcnn;
mod keypoint_head;
mod mask_head;
mod pooler;
mod res5;
mod rotated;
mod standard;

pub use base::*;
pub use box_head::*;
pub use cascade::*;
pub use fast_rcnn::*;
pub use keypoint_head::*;
pub use mask_head::*;
pub use pooler::*;
pub use res5::*;
pub use rotated::*;
pub use standard::*;

use crate::{
    common::*,
    structures::{InstancesList, ShapeSpec},
};

/// Everything needed to build any variant of ROI heads.
///
/// The mask and keypoint branches are enabled by their configs being present.
#[derive(Debug, Clone, PartialEq)]
pub struct RoiHeadsInit {
    pub roi_heads: RoiHeadsConfig,
    pub box_head: BoxHeadConfig,
    pub cascade: CascadeHeadConfig,
    pub mask_head: Option<MaskHeadConfig>,
    pub keypoint_head: Option<KeypointHeadConfig>,
    pub resnets: ResNetsConfig,
    pub detections_per_image: i64,
}

impl Default for RoiHeadsInit {
    fn default() -> Self {
        Self {
            roi_heads: Default::default(),
            box_head: Default::default(),
            cascade: Default::default(),
            mask_head: None,
            keypoint_head: None,
            resnets: Default::default(),
            detections_per_image: 100,
        }
    }
}

impl RoiHeadsInit {
    pub fn build<'p>(
        self,
        path: impl Borrow<nn::Path<'p>>,
        input_shapes: &IndexMap<String, ShapeSpec>,
    ) -> Result<RoiHeads> {
        let path = path.borrow();
        ensure!(
            self.detections_per_image > 0,
            "detections_per_image must be positive"
        );

        let heads = match self.roi_heads.name {
            RoiHeadsKind::Standard => {
                RoiHeads::Standard(StandardRoiHeads::new(path, &self, input_shapes)?)
            }
            RoiHeadsKind::Cascade => {
                RoiHeads::Cascade(CascadeRoiHeads::new(path, &self, input_shapes)?)
            }
            RoiHeadsKind::Res5 => RoiHeads::Res5(Res5RoiHeads::new(path, &self, input_shapes)?),
            RoiHeadsKind::Rotated => {
                RoiHeads::Rotated(RotatedRoiHeads::new(path, &self, input_shapes)?)
            }
        };
        Ok(heads)
    }
}

#[derive(Debug)]
pub enum RoiHeads {
    Standard(StandardRoiHeads),
    Cascade(CascadeRoiHeads),
    Res5(Res5RoiHeads),
    Rotated(RotatedRoiHeads),
}

impl RoiHeads {
    /// Losses over sampled proposals in training, detections in inference.
    ///
    /// Training returns the sampled proposals, inference the per-image detections.
    pub fn forward_t(
        &self,
        features: &FeatureMap,
        proposals: &InstancesList,
        targets: Option<&InstancesList>,
        train: bool,
    ) -> Result<(InstancesList, LossDict)> {
        match self {
            Self::Standard(heads) => heads.forward_t(features, proposals, targets, train),
            Self::Cascade(heads) => heads.forward_t(features, proposals, targets, train),
            Self::Res5(heads) => heads.forward_t(features, proposals, targets, train),
            Self::Rotated(heads) => heads.forward_t(features, proposals, targets, train),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_by_name() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let shapes: IndexMap<_, _> = vec![("p3".to_string(), ShapeSpec::new(8, 8))].into_iter().collect();
        let init = RoiHeadsInit {
            roi_heads: RoiHeadsConfig {
                name: RoiHeadsKind::Cascade,
                in_features: vec!["p3".into()],
                ..Default::default()
            },
            box_head: BoxHeadConfig {
                num_fc: 1,
                fc_dim: 8,
                cls_agnostic_bbox_reg: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let heads = init.clone().build(&vs.root() / "roi_heads", &shapes)?;
        assert!(matches!(heads, RoiHeads::Cascade(_)));

        let init = RoiHeadsInit {
            detections_per_image: 0,
            ..init
        };
        assert!(init.build(&vs.root() / "other", &shapes).is_err());
        Ok(())
    }

    #[test]
    fn kind_names() -> Result<()> {
        let kind: RoiHeadsKind = json5::from_str("\"CascadeROIHeads\"")?;
        assert_eq!(kind, RoiHeadsKind::Cascade);
        Ok(())
    }
}
