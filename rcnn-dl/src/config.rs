use crate::{
    anchor_generator::AnchorGeneratorInit,
    common::*,
    proposal::RpnInit,
    roi_heads::{
        BoxHeadConfig, CascadeHeadConfig, KeypointHeadConfig, MaskHeadConfig, ResNetsConfig,
        RoiHeadsConfig, RoiHeadsInit,
    },
};

pub use model::*;
pub use test::*;

/// The detector configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub test: TestConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = fs::read_to_string(path)?;
        let config = json5::from_str(&text)?;
        Ok(config)
    }

    /// Assemble the ROI heads settings, with the mask and keypoint branches if enabled.
    pub fn roi_heads_init(&self) -> RoiHeadsInit {
        let Self {
            model:
                ModelConfig {
                    mask_on,
                    keypoint_on,
                    roi_heads,
                    roi_box_head,
                    roi_box_cascade_head,
                    roi_mask_head,
                    roi_keypoint_head,
                    resnets,
                    ..
                },
            test: TestConfig {
                detections_per_image,
                ..
            },
        } = self;

        RoiHeadsInit {
            roi_heads: roi_heads.clone(),
            box_head: roi_box_head.clone(),
            cascade: roi_box_cascade_head.clone(),
            mask_head: mask_on.then(|| roi_mask_head.clone()),
            keypoint_head: keypoint_on.then(|| roi_keypoint_head.clone()),
            resnets: resnets.clone(),
            detections_per_image: *detections_per_image,
        }
    }
}

mod model {
    use super::*;

    /// The `MODEL` node.
    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ModelConfig {
        pub mask_on: bool,
        pub keypoint_on: bool,
        pub proposal_generator: ProposalGeneratorConfig,
        pub anchor_generator: AnchorGeneratorInit,
        pub rpn: RpnInit,
        pub roi_heads: RoiHeadsConfig,
        pub roi_box_head: BoxHeadConfig,
        pub roi_box_cascade_head: CascadeHeadConfig,
        pub roi_mask_head: MaskHeadConfig,
        pub roi_keypoint_head: KeypointHeadConfig,
        pub resnets: ResNetsConfig,
    }

    /// The `MODEL.PROPOSAL_GENERATOR` node.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ProposalGeneratorConfig {
        pub name: ProposalGeneratorKind,
        /// Proposals with a side shorter than this are dropped.
        pub min_size: R64,
    }

    impl Default for ProposalGeneratorConfig {
        fn default() -> Self {
            Self {
                name: ProposalGeneratorKind::Rpn,
                min_size: r64(0.0),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum ProposalGeneratorKind {
        #[serde(rename = "RPN")]
        Rpn,
        #[serde(rename = "RRPN")]
        Rrpn,
    }
}

mod test {
    use super::*;

    /// The `TEST` node.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TestConfig {
        pub detections_per_image: i64,
        /// Soft masks at or above this probability are foreground after pasting.
        pub mask_threshold: R64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            Self {
                detections_per_image: 100,
                mask_threshold: r64(0.5),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roi_heads::RoiHeadsKind;

    #[test]
    fn parse_partial_config() -> Result<()> {
        let text = r#"{
            model: {
                mask_on: true,
                proposal_generator: { name: "RRPN", min_size: 2.0 },
                roi_heads: { name: "CascadeROIHeads", num_classes: 3 },
                roi_box_cascade_head: { ious: [0.5, 0.55] },
            },
            test: { detections_per_image: 50 },
        }"#;
        let config: Config = json5::from_str(text)?;
        let ModelConfig {
            proposal_generator,
            roi_heads,
            roi_box_cascade_head,
            rpn,
            ..
        } = &config.model;

        assert_eq!(proposal_generator.name, ProposalGeneratorKind::Rrpn);
        assert_abs_diff_eq!(proposal_generator.min_size.raw(), 2.0);
        assert_eq!(roi_heads.name, RoiHeadsKind::Cascade);
        assert_eq!(roi_heads.num_classes, 3);
        assert_eq!(roi_box_cascade_head.ious, vec![r64(0.5), r64(0.55)]);
        assert_eq!(rpn, &RpnInit::default());

        let init = config.roi_heads_init();
        assert!(init.mask_head.is_some());
        assert!(init.keypoint_head.is_none());
        assert_eq!(init.detections_per_image, 50);
        Ok(())
    }

    #[test]
    fn open_missing_file() {
        assert!(Config::open("/nonexistent/rcnn.json5").is_err());
    }
}
