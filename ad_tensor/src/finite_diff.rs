//! Central-difference gradient checking.
//!
//! Both helpers evaluate `f` on Float64 CPU tensors and differentiate the sum
//! of its output, so any output shape is accepted.

use crate::creation::{tensor, TensorOptions};
use crate::dtype::DataType;
use crate::error::Result;
use crate::node::Tensor;
use crate::shape::Shape;

fn options(require_grad: bool) -> TensorOptions {
    TensorOptions::default()
        .dtype(DataType::Float64)
        .requires_grad(require_grad)
}

fn evaluate<F>(f: &F, inputs: &[(Vec<f64>, Shape)]) -> Result<f64>
where
    F: Fn(&[Tensor]) -> Result<Tensor>,
{
    let tensors = inputs
        .iter()
        .map(|(data, shape)| tensor(data, shape, &options(false)))
        .collect::<Result<Vec<_>>>()?;
    let output = f(&tensors)?;
    let total = output.value().sum()?;
    total.item::<f64>()
}

/// Numerical gradient of `sum(f(inputs))` with respect to every input element.
pub fn numeric_gradient<F>(f: F, inputs: &[(Vec<f64>, Shape)], eps: f64) -> Result<Vec<Vec<f64>>>
where
    F: Fn(&[Tensor]) -> Result<Tensor>,
{
    let mut grads = Vec::with_capacity(inputs.len());

    for input_idx in 0..inputs.len() {
        let mut input_grads = Vec::with_capacity(inputs[input_idx].0.len());

        for elem_idx in 0..inputs[input_idx].0.len() {
            let mut perturbed = inputs.to_vec();

            // f(x + eps)
            perturbed[input_idx].0[elem_idx] = inputs[input_idx].0[elem_idx] + eps;
            let plus = evaluate(&f, &perturbed)?;

            // f(x - eps)
            perturbed[input_idx].0[elem_idx] = inputs[input_idx].0[elem_idx] - eps;
            let minus = evaluate(&f, &perturbed)?;

            input_grads.push((plus - minus) / (2.0 * eps));
        }
        grads.push(input_grads);
    }

    Ok(grads)
}

/// Gradient of `sum(f(inputs))` computed by the backward pass.
pub fn analytic_gradient<F>(f: F, inputs: &[(Vec<f64>, Shape)]) -> Result<Vec<Vec<f64>>>
where
    F: Fn(&[Tensor]) -> Result<Tensor>,
{
    let tensors = inputs
        .iter()
        .map(|(data, shape)| tensor(data, shape, &options(true)))
        .collect::<Result<Vec<_>>>()?;
    f(&tensors)?.sum()?.backward()?;
    tensors
        .iter()
        .map(|t| t.grad()?.to_vec::<f64>())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_numeric_gradient_of_square() {
        let grads = numeric_gradient(
            |t| &t[0] * &t[0],
            &[(vec![1.0, -2.0, 3.0], Shape::from([3]))],
            1e-5,
        )
        .unwrap();
        for (g, expected) in grads[0].iter().zip([2.0, -4.0, 6.0]) {
            assert_abs_diff_eq!(*g, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_analytic_matches_numeric() {
        let f = |t: &[Tensor]| -> Result<Tensor> { (&t[0] * &t[1]) + t[0].sin()? };
        let inputs = [
            (vec![0.5, 1.5], Shape::from([2])),
            (vec![2.0, -1.0], Shape::from([2])),
        ];
        let analytic = analytic_gradient(f, &inputs).unwrap();
        let numeric = numeric_gradient(f, &inputs, 1e-6).unwrap();
        for (a, n) in analytic.iter().flatten().zip(numeric.iter().flatten()) {
            assert_abs_diff_eq!(*a, *n, epsilon = 1e-5);
        }
    }
}
