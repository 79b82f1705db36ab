use super::PoolerType;
use crate::{
    common::*,
    structures::{heatmaps_to_keypoints, Instances, InstancesList, Keypoints, ShapeSpec},
};

/// The `MODEL.ROI_KEYPOINT_HEAD` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeypointHeadConfig {
    pub pooler_resolution: i64,
    pub pooler_sampling_ratio: i64,
    pub pooler_type: PoolerType,
    pub conv_dims: Vec<i64>,
    pub num_keypoints: i64,
    pub normalize_loss_by_visible_keypoints: bool,
    pub loss_weight: R64,
}

impl Default for KeypointHeadConfig {
    fn default() -> Self {
        Self {
            pooler_resolution: 14,
            pooler_sampling_ratio: 0,
            pooler_type: PoolerType::RoiAlignV2,
            conv_dims: vec![512; 8],
            num_keypoints: 17,
            normalize_loss_by_visible_keypoints: true,
            loss_weight: r64(1.0),
        }
    }
}

/// 3x3 convs followed by a deconv and a bilinear 2x upsampling to heatmap logits.
#[derive(Debug)]
pub struct KrcnnConvDeconvUpsampleHead {
    convs: Vec<ConvNorm2D>,
    score_lowres: nn::ConvTranspose2D,
    num_keypoints: i64,
    loss_weight: f64,
    /// Fixed normalizer per image when the loss is not normalized by visible keypoints.
    normalizer_per_image: Option<f64>,
    num_skipped_batches: Cell<i64>,
}

impl KrcnnConvDeconvUpsampleHead {
    pub fn new<'p>(
        path: impl Borrow<nn::Path<'p>>,
        config: &KeypointHeadConfig,
        input_shape: ShapeSpec,
        batch_size_per_image: i64,
        positive_fraction: f64,
    ) -> Result<Self> {
        let path = path.borrow();
        let KeypointHeadConfig {
            ref conv_dims,
            num_keypoints,
            normalize_loss_by_visible_keypoints,
            loss_weight,
            ..
        } = *config;
        ensure!(num_keypoints > 0, "num_keypoints must be positive");

        let mut in_channels = input_shape.try_channels()?;
        let convs: Vec<_> = conv_dims
            .iter()
            .enumerate()
            .map(|(index, &out_channels)| -> Result<_> {
                let conv = ConvNorm2DInit::new(in_channels, out_channels, 3)
                    .build(path / format!("conv_fcn{}", index + 1))?;
                in_channels = out_channels;
                Ok(conv)
            })
            .try_collect()?;

        let score_lowres = nn::conv_transpose2d(
            path / "score_lowres",
            in_channels,
            num_keypoints,
            4,
            nn::ConvTransposeConfig {
                stride: 2,
                padding: 1,
                ..Default::default()
            },
        );

        let normalizer_per_image = (!normalize_loss_by_visible_keypoints)
            .then(|| num_keypoints as f64 * batch_size_per_image as f64 * positive_fraction);

        Ok(Self {
            convs,
            score_lowres,
            num_keypoints,
            loss_weight: loss_weight.raw(),
            normalizer_per_image,
            num_skipped_batches: Cell::new(0),
        })
    }

    pub fn num_keypoints(&self) -> i64 {
        self.num_keypoints
    }

    /// Heatmap logits `[R, K, 4S, 4S]` from pooled features `[R, D, S, S]`.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let xs = self
            .convs
            .iter()
            .fold(xs.shallow_clone(), |xs, conv| conv.forward_t(&xs, train))
            .apply(&self.score_lowres);
        let (_, _, height, width) = xs.size4().unwrap_or((0, 0, 0, 0));
        xs.upsample_bilinear2d(&[height * 2, width * 2], false, None, None)
    }

    /// The weighted `loss_keypoint`, zero when no proposal has a visible keypoint.
    pub fn loss(&self, pred_keypoint_logits: &Tensor, instances: &InstancesList) -> Result<Tensor> {
        let normalizer = self
            .normalizer_per_image
            .map(|per_image| per_image * instances.len() as f64);
        let loss = match keypoint_rcnn_loss(pred_keypoint_logits, instances, normalizer)? {
            Some(loss) => loss,
            None => {
                let num_skipped = self.num_skipped_batches.get() + 1;
                self.num_skipped_batches.set(num_skipped);
                debug!("kpts_num_skipped_batches: {}", num_skipped);
                pred_keypoint_logits.sum(Kind::Float) * 0.0
            }
        };
        Ok(loss * self.loss_weight)
    }
}

/// Cross entropy of heatmap logits `[R, K, S, S]` against the ground truth
/// keypoints of each proposal, summed over valid keypoints.
///
/// The sum is divided by `normalizer`, or by the number of valid keypoints when
/// it is `None`. Returns `None` if no keypoint is valid.
pub fn keypoint_rcnn_loss(
    pred_keypoint_logits: &Tensor,
    instances: &InstancesList,
    normalizer: Option<f64>,
) -> Result<Option<Tensor>> {
    let (num_regions, num_keypoints, height, width) = pred_keypoint_logits.size4()?;
    ensure!(
        height == width,
        "keypoint heatmaps must be square, but get {}x{}",
        height,
        width
    );
    let device = pred_keypoint_logits.device();

    let (heatmaps, valid): (Vec<_>, Vec<_>) = instances
        .iter()
        .filter(|instances| !instances.is_empty())
        .map(|instances| -> Result<_> {
            let keypoints = instances.get_keypoints("gt_keypoints")?;
            let boxes = instances.get_boxes("proposal_boxes")?.tensor();
            let (heatmaps, valid) = keypoints.to_heatmap(boxes, height)?;
            Ok((heatmaps.view([-1]), valid.view([-1])))
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .unzip();

    if heatmaps.is_empty() {
        return Ok(None);
    }
    let heatmaps = Tensor::f_cat(&heatmaps, 0)?.to_device(device);
    let valid = Tensor::f_cat(&valid, 0)?.to_device(device).nonzero_1d();
    if valid.is_empty() {
        return Ok(None);
    }

    let logits = pred_keypoint_logits.view([num_regions * num_keypoints, height * width]);
    let loss = CrossEntropyLoss::new(Reduction::Sum).forward(
        &logits.index_select(0, &valid),
        &heatmaps.index_select(0, &valid),
    );
    let normalizer = normalizer.unwrap_or(valid.numel() as f64);
    Ok(Some(loss / normalizer))
}

/// Attach `pred_keypoints` `[R_i, K, 3]` as (x, y, score) and the raw
/// `pred_keypoint_heatmaps` to each image's detections.
pub fn keypoint_rcnn_inference(
    pred_keypoint_logits: &Tensor,
    pred_instances: InstancesList,
) -> Result<InstancesList> {
    let (_, num_keypoints, _, _) = pred_keypoint_logits.size4()?;
    let device = pred_keypoint_logits.device();
    let boxes: Vec<_> = pred_instances
        .get_boxes_vec("pred_boxes")?
        .into_iter()
        .map(|boxes| boxes.into_tensor())
        .collect();
    let boxes = Tensor::f_cat_or(&boxes, || Tensor::zeros(&[0, 4], (Kind::Float, device)))?;

    let keypoint_results = heatmaps_to_keypoints(&pred_keypoint_logits.detach(), &boxes)?
        .index_select(2, &Tensor::of_slice(&[0i64, 1, 3]).to_device(device));

    let len_vec = pred_instances.len_vec();
    let keypoint_results = keypoint_results.f_split_rows(&len_vec)?;
    let heatmaps = pred_keypoint_logits.f_split_rows(&len_vec)?;

    izip!(pred_instances, keypoint_results, heatmaps)
        .map(|(instances, keypoints, heatmaps)| {
            debug_assert_eq!(keypoints.size()[1], num_keypoints);
            instances
                .with("pred_keypoints", Keypoints::new(keypoints)?)?
                .with("pred_keypoint_heatmaps", heatmaps)
        })
        .collect::<Result<Vec<Instances>>>()
        .map(InstancesList::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gt_instances(visibility: f32) -> Result<Instances> {
        let keypoints = Tensor::of_slice(&[2.0f32, 2.0, visibility, 6.0, 1.0, visibility]).view([1, 2, 3]);
        Instances::new(ImageSize::new_size(16, 16)?)
            .with("proposal_boxes", Boxes::from_xyxy(&[[0.0, 0.0, 8.0, 8.0]])?)?
            .with("gt_keypoints", Keypoints::new(keypoints)?)
    }

    #[test]
    fn head_output_shape() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = KeypointHeadConfig {
            conv_dims: vec![8, 8],
            num_keypoints: 5,
            ..Default::default()
        };
        let head = KrcnnConvDeconvUpsampleHead::new(
            &vs.root() / "keypoint_head",
            &config,
            ShapeSpec::new(4, 16),
            64,
            0.25,
        )?;
        let logits = head.forward_t(&Tensor::randn(&[2, 4, 7, 7], (Kind::Float, Device::Cpu)), false);
        assert_eq!(logits.size(), vec![2, 5, 28, 28]);
        Ok(())
    }

    #[test]
    fn loss_peaks_at_encoded_keypoints() -> Result<()> {
        let instances = InstancesList::new(vec![gt_instances(2.0)?]);
        // keypoints (2, 2) and (6, 1) land on cells 1 * 4 + 1 and 0 * 4 + 3
        let mut logits = Tensor::full(&[1, 2, 4, 4], -20.0, (Kind::Float, Device::Cpu));
        let _ = logits.get(0).get(0).get(1).get(1).fill_(20.0);
        let _ = logits.get(0).get(1).get(0).get(3).fill_(20.0);
        let loss = keypoint_rcnn_loss(&logits, &instances, None)?.ok_or_else(|| format_err!("no loss"))?;
        assert!(f64::from(&loss) < 1e-6);

        let _ = logits.fill_(0.0);
        let loss = keypoint_rcnn_loss(&logits, &instances, Some(4.0))?.ok_or_else(|| format_err!("no loss"))?;
        // two uniform 16-way predictions, summed and divided by 4
        assert_abs_diff_eq!(f64::from(&loss), 2.0 * 16f64.ln() / 4.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn invisible_keypoints_skip_the_batch() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = KeypointHeadConfig {
            conv_dims: vec![4],
            num_keypoints: 2,
            ..Default::default()
        };
        let head = KrcnnConvDeconvUpsampleHead::new(&vs.root(), &config, ShapeSpec::new(4, 16), 64, 0.25)?;
        let instances = InstancesList::new(vec![gt_instances(0.0)?]);
        let logits = Tensor::randn(&[1, 2, 4, 4], (Kind::Float, Device::Cpu));

        assert!(keypoint_rcnn_loss(&logits, &instances, None)?.is_none());
        assert_eq!(f64::from(head.loss(&logits, &instances)?), 0.0);
        assert_eq!(head.num_skipped_batches.get(), 1);
        Ok(())
    }

    #[test]
    fn inference_attaches_keypoints() -> Result<()> {
        let size = ImageSize::new_size(32, 32)?;
        let instances = InstancesList::new(vec![
            Instances::new(size).with("pred_boxes", Boxes::from_xyxy(&[[0.0, 0.0, 8.0, 8.0]])?)?,
            Instances::new(size).with("pred_boxes", Boxes::new(Tensor::zeros(&[0, 4], (Kind::Float, Device::Cpu)))?)?,
        ]);
        let logits = Tensor::randn(&[1, 3, 4, 4], (Kind::Float, Device::Cpu));
        let instances = keypoint_rcnn_inference(&logits, instances)?;

        let keypoints = instances[0].get_keypoints("pred_keypoints")?;
        assert_eq!(keypoints.tensor().size(), vec![1, 3, 3]);
        assert_eq!(instances[1].get_keypoints("pred_keypoints")?.len(), 0);
        assert_eq!(instances[0].get_tensor("pred_keypoint_heatmaps")?.size(), vec![1, 3, 4, 4]);
        Ok(())
    }
}
