use super::PoolerType;
use crate::{common::*, structures::ShapeSpec};

/// The `MODEL.ROI_BOX_HEAD` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxHeadConfig {
    pub pooler_resolution: i64,
    pub pooler_sampling_ratio: i64,
    pub pooler_type: PoolerType,
    pub num_fc: i64,
    pub fc_dim: i64,
    pub num_conv: i64,
    pub conv_dim: i64,
    pub norm: NormKind,
    pub cls_agnostic_bbox_reg: bool,
    pub bbox_reg_weights: Vec<R64>,
    pub smooth_l1_beta: R64,
    /// Feed the box head's refined boxes to the mask and keypoint heads in training.
    pub train_on_pred_boxes: bool,
}

impl Default for BoxHeadConfig {
    fn default() -> Self {
        Self {
            pooler_resolution: 14,
            pooler_sampling_ratio: 0,
            pooler_type: PoolerType::RoiAlignV2,
            num_fc: 0,
            fc_dim: 1024,
            num_conv: 0,
            conv_dim: 256,
            norm: NormKind::None,
            cls_agnostic_bbox_reg: false,
            bbox_reg_weights: vec![r64(10.0), r64(10.0), r64(5.0), r64(5.0)],
            smooth_l1_beta: r64(0.0),
            train_on_pred_boxes: false,
        }
    }
}

/// Stacked 3x3 convs followed by fully connected layers, ReLU after each.
#[derive(Debug)]
pub struct FastRcnnConvFcHead {
    convs: Vec<ConvNorm2D>,
    fcs: Vec<nn::Linear>,
    output_shape: ShapeSpec,
}

impl FastRcnnConvFcHead {
    pub fn new<'p>(
        path: impl Borrow<nn::Path<'p>>,
        config: &BoxHeadConfig,
        input_shape: ShapeSpec,
    ) -> Result<Self> {
        let path = path.borrow();
        let BoxHeadConfig {
            num_fc,
            fc_dim,
            num_conv,
            conv_dim,
            norm,
            ..
        } = *config;
        ensure!(
            num_conv >= 0 && num_fc >= 0 && num_conv + num_fc > 0,
            "the box head needs at least one conv or fc layer"
        );

        let mut output_shape = input_shape;
        let convs: Vec<_> = (0..num_conv)
            .map(|index| -> Result<_> {
                let conv = ConvNorm2DInit {
                    norm,
                    ..ConvNorm2DInit::new(output_shape.try_channels()?, conv_dim, 3)
                }
                .build(path / format!("conv{}", index + 1))?;
                output_shape.channels = Some(conv_dim);
                Ok(conv)
            })
            .try_collect()?;

        let fcs: Vec<_> = (0..num_fc)
            .map(|index| {
                let fc = nn::linear(
                    path / format!("fc{}", index + 1),
                    output_shape.prod(),
                    fc_dim,
                    Default::default(),
                );
                output_shape = ShapeSpec {
                    channels: Some(fc_dim),
                    height: Some(1),
                    width: Some(1),
                    stride: None,
                };
                fc
            })
            .collect();

        Ok(Self {
            convs,
            fcs,
            output_shape,
        })
    }

    pub fn output_shape(&self) -> ShapeSpec {
        self.output_shape
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let xs = self
            .convs
            .iter()
            .fold(xs.shallow_clone(), |xs, conv| conv.forward_t(&xs, train));
        if self.fcs.is_empty() {
            return xs;
        }
        let xs = if xs.dim() > 2 { xs.flatten(1, -1) } else { xs };
        self.fcs
            .iter()
            .fold(xs, |xs, fc| xs.apply(fc).relu())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_fc_head_shapes() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = BoxHeadConfig {
            num_conv: 2,
            conv_dim: 8,
            num_fc: 1,
            fc_dim: 32,
            ..Default::default()
        };
        let input_shape = ShapeSpec {
            channels: Some(4),
            height: Some(7),
            width: Some(7),
            stride: None,
        };
        let head = FastRcnnConvFcHead::new(&vs.root() / "box_head", &config, input_shape)?;
        assert_eq!(head.output_shape().prod(), 32);

        let output = head.forward_t(&Tensor::randn(&[3, 4, 7, 7], (Kind::Float, Device::Cpu)), false);
        assert_eq!(output.size(), vec![3, 32]);
        assert!(bool::from(output.ge(0.0).all()));
        Ok(())
    }

    #[test]
    fn head_requires_layers() {
        let vs = nn::VarStore::new(Device::Cpu);
        let result = FastRcnnConvFcHead::new(
            &vs.root(),
            &BoxHeadConfig::default(),
            ShapeSpec::new(4, 16),
        );
        assert!(result.is_err());
    }
}
