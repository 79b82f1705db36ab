use super::PoolerType;
use crate::{
    common::*,
    structures::{Instances, InstancesList, Sequence, ShapeSpec},
};

/// The `MODEL.ROI_MASK_HEAD` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskHeadConfig {
    pub pooler_resolution: i64,
    pub pooler_sampling_ratio: i64,
    pub pooler_type: PoolerType,
    pub num_conv: i64,
    pub conv_dim: i64,
    pub norm: NormKind,
    pub cls_agnostic_mask: bool,
}

impl Default for MaskHeadConfig {
    fn default() -> Self {
        Self {
            pooler_resolution: 14,
            pooler_sampling_ratio: 0,
            pooler_type: PoolerType::RoiAlignV2,
            num_conv: 0,
            conv_dim: 256,
            norm: NormKind::None,
            cls_agnostic_mask: false,
        }
    }
}

/// 3x3 convs, a 2x deconv upsampling and a 1x1 per-class mask predictor.
#[derive(Debug)]
pub struct MaskRcnnConvUpsampleHead {
    convs: Vec<ConvNorm2D>,
    deconv: nn::ConvTranspose2D,
    predictor: nn::Conv2D,
}

impl MaskRcnnConvUpsampleHead {
    pub fn new<'p>(
        path: impl Borrow<nn::Path<'p>>,
        config: &MaskHeadConfig,
        num_classes: i64,
        input_shape: ShapeSpec,
    ) -> Result<Self> {
        let path = path.borrow();
        let MaskHeadConfig {
            num_conv,
            conv_dim,
            norm,
            cls_agnostic_mask,
            ..
        } = *config;
        ensure!(num_conv >= 0, "num_conv must be non-negative");
        ensure!(conv_dim > 0, "conv_dim must be positive");
        let in_channels = input_shape.try_channels()?;

        let convs: Vec<_> = (0..num_conv)
            .map(|index| {
                let in_c = if index == 0 { in_channels } else { conv_dim };
                ConvNorm2DInit {
                    norm,
                    ws_init: nn::Init::KaimingUniform,
                    ..ConvNorm2DInit::new(in_c, conv_dim, 3)
                }
                .build(path / format!("mask_fcn{}", index + 1))
            })
            .try_collect()?;

        let deconv_in = if num_conv > 0 { conv_dim } else { in_channels };
        let deconv = nn::conv_transpose2d(
            path / "deconv",
            deconv_in,
            conv_dim,
            2,
            nn::ConvTransposeConfig {
                stride: 2,
                padding: 0,
                ..Default::default()
            },
        );

        let num_mask_classes = if cls_agnostic_mask { 1 } else { num_classes };
        let predictor = nn::conv2d(
            path / "predictor",
            conv_dim,
            num_mask_classes,
            1,
            nn::ConvConfig {
                ws_init: nn::Init::Randn {
                    mean: 0.0,
                    stdev: 0.001,
                },
                bs_init: nn::Init::Const(0.0),
                ..Default::default()
            },
        );

        Ok(Self {
            convs,
            deconv,
            predictor,
        })
    }

    /// Mask logits `[R, C, 2S, 2S]` from pooled features `[R, D, S, S]`.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.convs
            .iter()
            .fold(xs.shallow_clone(), |xs, conv| conv.forward_t(&xs, train))
            .apply(&self.deconv)
            .relu()
            .apply(&self.predictor)
    }
}

/// Rasterize ground truth masks of either representation inside `boxes`.
fn crop_and_resize_masks(masks: &Sequence, boxes: &Tensor, mask_size: i64) -> Result<Tensor> {
    match masks {
        Sequence::BitMasks(masks) => masks.crop_and_resize(boxes, mask_size),
        Sequence::PolygonMasks(masks) => masks.crop_and_resize(boxes, mask_size),
        other => bail!("gt_masks must be masks, but get {}", other.kind_name()),
    }
}

/// Binary cross entropy between mask logits `[R, C, M, M]` and the ground truth
/// masks cropped by `proposal_boxes`.
///
/// Only the channel of each region's `gt_classes` contributes unless the
/// prediction is class agnostic.
pub fn mask_rcnn_loss(pred_mask_logits: &Tensor, instances: &InstancesList) -> Result<Tensor> {
    let (num_regions, num_masks, mask_height, mask_width) = pred_mask_logits.size4()?;
    ensure!(
        mask_height == mask_width,
        "mask prediction must be square, but get {}x{}",
        mask_height,
        mask_width
    );
    let cls_agnostic_mask = num_masks == 1;

    let (gt_classes, gt_masks): (Vec<_>, Vec<_>) = instances
        .iter()
        .filter(|instances| !instances.is_empty())
        .map(|instances| -> Result<_> {
            let gt_classes = instances.get_tensor("gt_classes")?.to_kind(Kind::Int64);
            let boxes = instances.get_boxes("proposal_boxes")?.tensor();
            let gt_masks = crop_and_resize_masks(instances.get("gt_masks")?, boxes, mask_height)?
                .to_device(pred_mask_logits.device());
            Ok((gt_classes, gt_masks))
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .unzip();

    if gt_masks.is_empty() {
        return Ok(pred_mask_logits.sum(Kind::Float) * 0.0);
    }
    let gt_masks = Tensor::f_cat(&gt_masks, 0)?;
    ensure!(
        gt_masks.size()[0] == num_regions,
        "expect {} ground truth masks, but get {}",
        num_regions,
        gt_masks.size()[0]
    );

    let pred_mask_logits = if cls_agnostic_mask {
        pred_mask_logits.select(1, 0)
    } else {
        let gt_classes = Tensor::f_cat(&gt_classes, 0)?;
        let indices = Tensor::arange(num_regions, (Kind::Int64, pred_mask_logits.device()));
        pred_mask_logits.index(&[Some(indices), Some(gt_classes)])
    };

    {
        let mask_incorrect = pred_mask_logits.gt(0.0).logical_xor(&gt_masks);
        let num_incorrect = mask_incorrect.count_true();
        let num_elements = mask_incorrect.numel() as i64;
        let num_positive = gt_masks.count_true();
        let false_positive = mask_incorrect.logical_and(&gt_masks.logical_not()).count_true();
        let false_negative = mask_incorrect.logical_and(&gt_masks).count_true();
        debug!(
            "mask_rcnn/accuracy: {}",
            1.0 - num_incorrect as f64 / num_elements.max(1) as f64
        );
        debug!(
            "mask_rcnn/false_positive: {}",
            false_positive as f64 / (num_elements - num_positive).max(1) as f64
        );
        debug!(
            "mask_rcnn/false_negative: {}",
            false_negative as f64 / num_positive.max(1) as f64
        );
    }

    let loss = BceWithLogitsLossInit::default(Reduction::Mean)
        .build()
        .forward(&pred_mask_logits, &gt_masks.to_kind(pred_mask_logits.kind()));
    Ok(loss)
}

/// Attach `pred_masks` `[R_i, 1, M, M]` probabilities of the predicted classes.
pub fn mask_rcnn_inference(
    pred_mask_logits: &Tensor,
    pred_instances: InstancesList,
) -> Result<InstancesList> {
    let (num_regions, num_masks, _, _) = pred_mask_logits.size4()?;
    let mask_probs = if num_masks == 1 {
        pred_mask_logits.sigmoid()
    } else {
        let pred_classes = Tensor::f_cat_or(&pred_instances.get_tensor_vec("pred_classes")?, || {
            Tensor::zeros(&[0], (Kind::Int64, pred_mask_logits.device()))
        })?;
        let indices = Tensor::arange(num_regions, (Kind::Int64, pred_mask_logits.device()));
        pred_mask_logits
            .index(&[Some(indices), Some(pred_classes)])
            .unsqueeze(1)
            .sigmoid()
    };

    let mask_probs = mask_probs.f_split_rows(&pred_instances.len_vec())?;
    izip!(pred_instances, mask_probs)
        .map(|(instances, probs)| instances.with("pred_masks", probs))
        .collect::<Result<Vec<Instances>>>()
        .map(InstancesList::new)
}
