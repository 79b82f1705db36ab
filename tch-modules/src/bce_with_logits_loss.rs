use crate::common::*;

#[derive(Debug)]
pub struct BceWithLogitsLossInit {
    pub pos_weight: Option<Tensor>,
    pub reduction: Reduction,
}

impl BceWithLogitsLossInit {
    pub fn default(reduction: Reduction) -> Self {
        Self {
            pos_weight: None,
            reduction,
        }
    }

    pub fn build(self) -> BceWithLogitsLoss {
        let Self {
            pos_weight,
            reduction,
        } = self;

        BceWithLogitsLoss {
            pos_weight: pos_weight.map(|weight| weight.detach()),
            reduction,
        }
    }
}

/// Binary cross entropy on logits with float targets in `[0, 1]`.
#[derive(Debug)]
pub struct BceWithLogitsLoss {
    pos_weight: Option<Tensor>,
    reduction: Reduction,
}

impl BceWithLogitsLoss {
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Tensor {
        debug_assert_eq!(
            input.size(),
            target.size(),
            "input and target tensors must have equal shape"
        );
        debug_assert!(
            target.is_empty() || bool::from(target.ge(0.0).logical_and(&target.le(1.0)).all()),
            "target values must be in range of [0.0, 1.0]"
        );

        // mean over nothing is NaN, so keep the graph alive with a zero
        if input.is_empty() && self.reduction == Reduction::Mean {
            return input.sum(Kind::Float) * 0.0;
        }

        input.binary_cross_entropy_with_logits::<&Tensor>(
            &target.to_kind(input.kind()),
            None,
            self.pos_weight.as_ref(),
            self.reduction,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn soft_targets() {
        let input = Tensor::of_slice(&[0.0f32, 2.0, -2.0]);
        let target = Tensor::of_slice(&[0.5f32, 1.0, 0.0]);
        let loss = BceWithLogitsLossInit::default(Reduction::Sum)
            .build()
            .forward(&input, &target);

        // -[t ln σ(x) + (1 - t) ln(1 - σ(x))] per element
        let expect = 2f64.ln() + 2.0 * (1.0 + (-2f64).exp()).ln();
        assert_abs_diff_eq!(f64::from(loss), expect, epsilon = 1e-5);
    }

    #[test]
    fn positive_weight_scales_positive_terms() {
        let input = Tensor::of_slice(&[1.0f32, 1.0]);
        let target = Tensor::of_slice(&[1.0f32, 0.0]);
        let loss_fn = |pos_weight| {
            f64::from(
                BceWithLogitsLossInit {
                    pos_weight,
                    reduction: Reduction::None,
                }
                .build()
                .forward(&input, &target)
                .get(0),
            )
        };

        let plain = loss_fn(None);
        let weighted = loss_fn(Some(Tensor::of_slice(&[3.0f32])));
        assert_abs_diff_eq!(weighted, 3.0 * plain, epsilon = 1e-5);
    }

    #[test]
    fn empty_mask_logits() {
        let loss_fn = BceWithLogitsLossInit::default(Reduction::Mean).build();
        let empty = Tensor::zeros(&[0, 1, 4, 4], (Kind::Float, Device::Cpu));
        let loss = loss_fn.forward(&empty, &empty);
        assert_abs_diff_eq!(f64::from(loss), 0.0);
    }
}
