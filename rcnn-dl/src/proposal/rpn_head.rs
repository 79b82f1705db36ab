use crate::common::*;

/// A shared 3x3 conv followed by sibling 1x1 convs predicting objectness and anchor deltas.
#[derive(Debug)]
pub struct StandardRpnHead {
    conv: ConvNorm2D,
    objectness_logits: ConvNorm2D,
    anchor_deltas: ConvNorm2D,
}

impl StandardRpnHead {
    pub fn new<'p>(
        path: impl Borrow<nn::Path<'p>>,
        in_channels: i64,
        num_anchors: i64,
        box_dim: i64,
    ) -> Result<Self> {
        let path = path.borrow();
        ensure!(num_anchors > 0, "the number of anchors must be positive");
        let ws_init = nn::Init::Randn {
            mean: 0.0,
            stdev: 0.01,
        };

        let conv = ConvNorm2DInit {
            ws_init,
            ..ConvNorm2DInit::new(in_channels, in_channels, 3)
        }
        .build(path / "conv")?;
        let objectness_logits = ConvNorm2DInit {
            relu: false,
            ws_init,
            ..ConvNorm2DInit::new(in_channels, num_anchors, 1)
        }
        .build(path / "objectness_logits")?;
        let anchor_deltas = ConvNorm2DInit {
            relu: false,
            ws_init,
            ..ConvNorm2DInit::new(in_channels, num_anchors * box_dim, 1)
        }
        .build(path / "anchor_deltas")?;

        Ok(Self {
            conv,
            objectness_logits,
            anchor_deltas,
        })
    }

    /// Returns per-level `[N, A, H, W]` objectness logits and `[N, A * B, H, W]` deltas.
    pub fn forward_t<T>(&self, features: &[T], train: bool) -> (Vec<Tensor>, Vec<Tensor>)
    where
        T: Borrow<Tensor>,
    {
        features
            .iter()
            .map(|feature| {
                let xs = self.conv.forward_t(feature.borrow(), train);
                (
                    self.objectness_logits.forward_t(&xs, train),
                    self.anchor_deltas.forward_t(&xs, train),
                )
            })
            .unzip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpn_head_shapes() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = StandardRpnHead::new(&vs.root() / "rpn_head", 16, 3, 4)?;
        let features = vec![
            Tensor::randn(&[2, 16, 8, 10], (Kind::Float, Device::Cpu)),
            Tensor::randn(&[2, 16, 4, 5], (Kind::Float, Device::Cpu)),
        ];
        let (logits, deltas) = head.forward_t(&features, false);
        assert_eq!(logits[0].size(), vec![2, 3, 8, 10]);
        assert_eq!(deltas[1].size(), vec![2, 12, 4, 5]);
        Ok(())
    }
}
