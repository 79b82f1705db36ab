use crate::{
    common::*,
    conv_norm_2d::{ConvNorm2D, ConvNorm2DInit, NormKind},
};

/// Residual block of a 1x1, a 3x3 and a 1x1 convolution as in ResNet.
#[derive(Debug, Clone)]
pub struct BottleneckBlockInit {
    pub in_channels: i64,
    pub out_channels: i64,
    pub bottleneck_channels: i64,
    pub stride: i64,
    pub num_groups: i64,
    pub norm: NormKind,
    /// Put the stride in the first 1x1 conv instead of the 3x3 conv.
    pub stride_in_1x1: bool,
    pub dilation: i64,
}

impl BottleneckBlockInit {
    pub fn new(in_channels: i64, out_channels: i64, bottleneck_channels: i64) -> Self {
        Self {
            in_channels,
            out_channels,
            bottleneck_channels,
            stride: 1,
            num_groups: 1,
            norm: NormKind::FrozenBatchNorm,
            stride_in_1x1: false,
            dilation: 1,
        }
    }

    pub fn build<'p, P>(self, path: P) -> Result<BottleneckBlock>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            in_channels,
            out_channels,
            bottleneck_channels,
            stride,
            num_groups,
            norm,
            stride_in_1x1,
            dilation,
        } = self;

        let (stride_1x1, stride_3x3) = if stride_in_1x1 {
            (stride, 1)
        } else {
            (1, stride)
        };

        let shortcut = if in_channels != out_channels {
            Some(
                ConvNorm2DInit {
                    s: stride,
                    bias: false,
                    norm,
                    relu: false,
                    ..ConvNorm2DInit::new(in_channels, out_channels, 1)
                }
                .build(path / "shortcut")?,
            )
        } else {
            None
        };

        let conv1 = ConvNorm2DInit {
            s: stride_1x1,
            bias: false,
            norm,
            ..ConvNorm2DInit::new(in_channels, bottleneck_channels, 1)
        }
        .build(path / "conv1")?;
        let conv2 = ConvNorm2DInit {
            s: stride_3x3,
            p: dilation,
            d: dilation,
            g: num_groups,
            bias: false,
            norm,
            ..ConvNorm2DInit::new(bottleneck_channels, bottleneck_channels, 3)
        }
        .build(path / "conv2")?;
        let conv3 = ConvNorm2DInit {
            bias: false,
            norm,
            relu: false,
            ..ConvNorm2DInit::new(bottleneck_channels, out_channels, 1)
        }
        .build(path / "conv3")?;

        Ok(BottleneckBlock {
            conv1,
            conv2,
            conv3,
            shortcut,
        })
    }
}

#[derive(Debug)]
pub struct BottleneckBlock {
    conv1: ConvNorm2D,
    conv2: ConvNorm2D,
    conv3: ConvNorm2D,
    shortcut: Option<ConvNorm2D>,
}

impl nn::ModuleT for BottleneckBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let Self {
            conv1,
            conv2,
            conv3,
            shortcut,
        } = self;

        let out = conv3.forward_t(&conv2.forward_t(&conv1.forward_t(xs, train), train), train);
        let identity = match shortcut {
            Some(shortcut) => shortcut.forward_t(xs, train),
            None => xs.shallow_clone(),
        };
        (out + identity).relu()
    }
}

/// Build `num_blocks` bottleneck blocks where only the first one downsamples.
pub fn bottleneck_stage<'p>(
    path: impl Borrow<nn::Path<'p>>,
    first: BottleneckBlockInit,
    num_blocks: usize,
) -> Result<Vec<BottleneckBlock>> {
    let path = path.borrow();
    let out_channels = first.out_channels;

    (0..num_blocks)
        .map(|index| {
            let init = if index == 0 {
                first.clone()
            } else {
                BottleneckBlockInit {
                    in_channels: out_channels,
                    stride: 1,
                    ..first.clone()
                }
            };
            init.build(path / index)
        })
        .try_collect()
}
