use crate::common::*;

/// Softmax cross entropy against int64 class indices.
#[derive(Debug)]
pub struct CrossEntropyLoss {
    reduction: Reduction,
}

impl CrossEntropyLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    /// Loss of `[n, num_classes]` logits against `[n]` class indices.
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Tensor {
        debug_assert!(
            input.dim() == 2 && target.size() == [input.size()[0]] && target.kind() == Kind::Int64,
            "expect [n, num_classes] logits and [n] int64 targets"
        );
        debug_assert!(
            target.is_empty()
                || bool::from(target.ge(0i64).logical_and(&target.lt(input.size()[1])).all()),
            "target classes are out of range"
        );

        if input.is_empty() {
            return match self.reduction {
                Reduction::None => Tensor::zeros(&[0], (input.kind(), input.device())),
                _ => input.sum(Kind::Float) * 0.0,
            };
        }

        let loss = -input
            .log_softmax(-1, Kind::Float)
            .gather(1, &target.unsqueeze(1), false)
            .squeeze_dim(1);

        match self.reduction {
            Reduction::None => loss,
            Reduction::Sum => loss.sum(Kind::Float),
            Reduction::Mean | Reduction::Other(_) => loss.mean(Kind::Float),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn per_row_losses() {
        let input = Tensor::of_slice(&[8.0f32, 0.0, 0.0, 0.0, 0.0, 0.0]).view([2, 3]);
        let target = Tensor::of_slice(&[0i64, 2]);

        let loss = Vec::<f32>::from(CrossEntropyLoss::new(Reduction::None).forward(&input, &target));
        let confident = (1.0 + 2.0 * (-8f64).exp()).ln();
        assert_abs_diff_eq!(loss[0] as f64, confident, epsilon = 1e-5);
        assert_abs_diff_eq!(loss[1] as f64, 3f64.ln(), epsilon = 1e-5);

        let mean = f64::from(CrossEntropyLoss::new(Reduction::Mean).forward(&input, &target));
        assert_abs_diff_eq!(mean, (confident + 3f64.ln()) / 2.0, epsilon = 1e-5);
    }

    #[test]
    fn uniform_logits_and_empty_input() {
        let loss_fn = CrossEntropyLoss::new(Reduction::Sum);
        let input = Tensor::zeros(&[3, 4], (Kind::Float, Device::Cpu));
        let target = Tensor::of_slice(&[0i64, 1, 3]);
        let loss = f64::from(loss_fn.forward(&input, &target));
        assert_abs_diff_eq!(loss, 3.0 * 4f64.ln(), epsilon = 1e-5);

        let empty = Tensor::zeros(&[0, 4], (Kind::Float, Device::Cpu));
        let no_target = Tensor::zeros(&[0], (Kind::Int64, Device::Cpu));
        let loss = CrossEntropyLoss::new(Reduction::Mean).forward(&empty, &no_target);
        assert_abs_diff_eq!(f64::from(loss), 0.0);
    }
}
