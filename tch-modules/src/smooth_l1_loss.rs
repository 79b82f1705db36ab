use crate::common::*;

/// Huber-style loss that is quadratic below `beta` and linear above.
///
/// A `beta` below `1e-5` degrades to plain L1 loss.
#[derive(Debug, Clone, Copy)]
pub struct SmoothL1Loss {
    beta: f64,
    reduction: Reduction,
}

impl SmoothL1Loss {
    pub fn new(beta: f64, reduction: Reduction) -> Self {
        debug_assert!(beta >= 0.0, "beta must be non-negative");
        Self { beta, reduction }
    }

    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Tensor {
        let Self { beta, reduction } = *self;
        let diff = (input - target).abs();

        let loss = if beta < 1e-5 {
            diff
        } else {
            let quadratic = diff.square() * (0.5 / beta);
            let linear = &diff - 0.5 * beta;
            quadratic.where_self(&diff.lt(beta), &linear)
        };

        match reduction {
            Reduction::None => loss,
            Reduction::Sum => loss.sum(Kind::Float),
            Reduction::Mean => {
                if loss.is_empty() {
                    loss.sum(Kind::Float) * 0.0
                } else {
                    loss.mean(Kind::Float)
                }
            }
            Reduction::Other(_) => unimplemented!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn smooth_l1_pieces() {
        let input = Tensor::of_slice(&[0.0f32, 0.5, 2.0, -3.0]);
        let target = Tensor::zeros(&[4], (Kind::Float, Device::Cpu));

        let loss = SmoothL1Loss::new(1.0, Reduction::None).forward(&input, &target);
        let values = Vec::<f32>::from(&loss);
        let expect = [0.0, 0.125, 1.5, 2.5];
        values.iter().zip(expect.iter()).for_each(|(&lhs, &rhs)| {
            assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-6);
        });

        let l1 = SmoothL1Loss::new(0.0, Reduction::Sum).forward(&input, &target);
        assert_abs_diff_eq!(f64::from(l1), 5.5, epsilon = 1e-6);
    }

    #[test]
    fn smooth_l1_continuous_at_beta() {
        let beta = 0.1;
        let target = Tensor::zeros(&[2], (Kind::Double, Device::Cpu));
        let input = Tensor::of_slice(&[beta - 1e-9, beta + 1e-9]);
        let loss = Vec::<f64>::from(&SmoothL1Loss::new(beta, Reduction::None).forward(&input, &target));
        assert_abs_diff_eq!(loss[0], loss[1], epsilon = 1e-8);
    }
}
