//! Stochastic Gradient Descent optimizer.

use ad_tensor::prelude::*;

use super::Optimizer;

/// Plain SGD: param = param - lr * grad
pub struct SGD {
    params: Vec<Tensor>,
    /// Learning rate.
    pub lr: f64,
}

impl SGD {
    pub fn new(params: Vec<Tensor>, lr: f64) -> Self {
        SGD { params, lr }
    }
}

impl Optimizer for SGD {
    fn parameters(&self) -> &[Tensor] {
        &self.params
    }

    /// Parameters that do not require gradients are skipped.
    fn step(&mut self) -> Result<()> {
        for param in self.params.iter().filter(|p| p.requires_grad()) {
            let delta = param.grad()?.mul_scalar(self.lr)?;
            param.value_mut().sub_assign(&delta)?;
        }
        Ok(())
    }
}
