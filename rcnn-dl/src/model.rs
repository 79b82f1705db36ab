use crate::{
    common::*,
    config::{Config, ModelConfig, ProposalGeneratorKind, TestConfig},
    postprocess::postprocess_batch,
    proposal::ProposalGenerator,
    roi_heads::RoiHeads,
    structures::{ImageList, Instances, InstancesList, ShapeSpec},
};

/// Output of [GeneralizedRcnnHeads::forward_t].
#[derive(Debug)]
pub enum RcnnOutput {
    Losses(LossDict),
    Detections(Vec<Instances>),
}

/// The proposal generator and ROI heads on top of a backbone.
#[derive(Debug)]
pub struct GeneralizedRcnnHeads {
    proposal_generator: ProposalGenerator,
    roi_heads: RoiHeads,
    mask_threshold: f64,
}

impl GeneralizedRcnnHeads {
    /// Build both stages for backbone features described by `input_shapes`.
    pub fn new<'p>(
        path: impl Borrow<nn::Path<'p>>,
        config: &Config,
        input_shapes: &IndexMap<String, ShapeSpec>,
    ) -> Result<Self> {
        let path = path.borrow();
        let Config {
            model:
                ModelConfig {
                    proposal_generator,
                    anchor_generator,
                    rpn,
                    ..
                },
            test: TestConfig { mask_threshold, .. },
        } = config;

        let min_box_size = proposal_generator.min_size.raw();
        let proposal_generator = match proposal_generator.name {
            ProposalGeneratorKind::Rpn => ProposalGenerator::Rpn(rpn.clone().build(
                path / "proposal_generator",
                input_shapes,
                anchor_generator.clone(),
                min_box_size,
            )?),
            ProposalGeneratorKind::Rrpn => ProposalGenerator::Rrpn(rpn.clone().build_rotated(
                path / "proposal_generator",
                input_shapes,
                anchor_generator.clone(),
                min_box_size,
            )?),
        };
        let roi_heads = config
            .roi_heads_init()
            .build(path / "roi_heads", input_shapes)?;

        info!(
            "built {:?} proposals with {:?}",
            config.model.proposal_generator.name, config.model.roi_heads.name
        );

        Ok(Self {
            proposal_generator,
            roi_heads,
            mask_threshold: mask_threshold.raw(),
        })
    }

    pub fn proposal_generator(&self) -> &ProposalGenerator {
        &self.proposal_generator
    }

    pub fn roi_heads(&self) -> &RoiHeads {
        &self.roi_heads
    }

    /// Losses of both stages in training, post-processed detections in inference.
    pub fn forward_t(
        &self,
        images: &ImageList,
        features: &FeatureMap,
        targets: Option<&InstancesList>,
        train: bool,
    ) -> Result<RcnnOutput> {
        if train {
            let losses = self.losses(images, features, targets)?;
            Ok(RcnnOutput::Losses(losses))
        } else {
            let detections = self.inference(images, features, None)?;
            Ok(RcnnOutput::Detections(detections))
        }
    }

    /// Proposal and ROI head losses merged into one dict.
    pub fn losses(
        &self,
        images: &ImageList,
        features: &FeatureMap,
        targets: Option<&InstancesList>,
    ) -> Result<LossDict> {
        let targets = targets.ok_or_else(|| format_err!("targets are required in training"))?;
        let (proposals, mut losses) =
            self.proposal_generator
                .forward_t(images, features, Some(targets), true)?;
        let (_, detector_losses) = self
            .roi_heads
            .forward_t(features, &proposals, Some(targets), true)?;
        losses.extend(detector_losses);
        Ok(losses)
    }

    /// Detections of each image, rescaled to `output_sizes` or else to the input image sizes.
    pub fn inference(
        &self,
        images: &ImageList,
        features: &FeatureMap,
        output_sizes: Option<&[ImageSize]>,
    ) -> Result<Vec<Instances>> {
        let (proposals, _) = self
            .proposal_generator
            .forward_t(images, features, None, false)?;
        let (detections, _) = self
            .roi_heads
            .forward_t(features, &proposals, None, false)?;
        let detections = detections.into_inner();
        postprocess_batch(&detections, output_sizes, self.mask_threshold)
    }
}
