use crate::common::*;

/// Identity in the forward pass, multiplies the gradient by `scale` in the backward pass.
pub fn scale_gradient(input: &Tensor, scale: f64) -> Tensor {
    input * scale + (input * (1.0 - scale)).detach()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn scale_gradient_backward() {
        let input = Tensor::of_slice(&[1.0f32, -2.0, 3.0]).set_requires_grad(true);
        let output = scale_gradient(&input, 1.0 / 3.0);
        assert_abs_diff_eq!(
            f64::from((&output - &input).abs().max()),
            0.0,
            epsilon = 1e-6
        );

        (output * 2.0).sum(Kind::Float).backward();
        let grad = Vec::<f32>::from(&input.grad());
        grad.iter().for_each(|&g| assert_abs_diff_eq!(g, 2.0 / 3.0, epsilon = 1e-6));
    }
}
