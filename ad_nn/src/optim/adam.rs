//! Adam optimizer.

use std::sync::Arc;

use ad_tensor::device::BinaryOp;
use ad_tensor::prelude::*;

use super::Optimizer;

/// Per-parameter moment estimates, created on the parameter's device at
/// the first step.
struct Moments {
    m: TensorValue,
    v: TensorValue,
}

/// Adam optimizer (Adaptive Moment Estimation).
pub struct Adam {
    params: Vec<Tensor>,
    /// Learning rate.
    pub lr: f64,
    /// Exponential decay rate for first moment.
    pub beta1: f64,
    /// Exponential decay rate for second moment.
    pub beta2: f64,
    /// Small constant for numerical stability.
    pub eps: f64,
    moments: Vec<Option<Moments>>,
    /// Step counter.
    t: i32,
}

impl Adam {
    /// Create a new Adam optimizer with default hyperparameters.
    pub fn new(params: Vec<Tensor>, lr: f64) -> Self {
        Self::with_hyperparameters(params, lr, 0.9, 0.999, 1e-8)
    }

    pub fn with_hyperparameters(params: Vec<Tensor>, lr: f64, beta1: f64, beta2: f64, eps: f64) -> Self {
        let moments = params.iter().map(|_| None).collect();
        Adam {
            params,
            lr,
            beta1,
            beta2,
            eps,
            moments,
            t: 0,
        }
    }

    /// Number of steps taken so far.
    pub fn timestep(&self) -> i32 {
        self.t
    }

    /// Forget the moment estimates and restart the step counter.
    pub fn reset(&mut self) {
        self.moments.iter_mut().for_each(|m| *m = None);
        self.t = 0;
    }
}

impl Optimizer for Adam {
    fn parameters(&self) -> &[Tensor] {
        &self.params
    }

    fn step(&mut self) -> Result<()> {
        self.t += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(self.t);
        let bias_correction2 = 1.0 - self.beta2.powi(self.t);

        for (param, slot) in self.params.iter().zip(self.moments.iter_mut()) {
            if !param.requires_grad() {
                continue;
            }
            let grad = param.grad()?;
            if slot.is_none() {
                *slot = Some(Moments {
                    m: TensorValue::zeros(grad.shape().clone(), grad.dtype(), Arc::clone(grad.device()))?,
                    v: TensorValue::zeros(grad.shape().clone(), grad.dtype(), Arc::clone(grad.device()))?,
                });
            }
            let Some(moments) = slot.as_mut() else {
                continue;
            };

            // m = beta1 * m + (1 - beta1) * g
            moments.m.binary_scalar_assign(BinaryOp::Mul, self.beta1)?;
            moments.m.add_assign(&grad.mul_scalar(1.0 - self.beta1)?)?;

            // v = beta2 * v + (1 - beta2) * g^2
            moments.v.binary_scalar_assign(BinaryOp::Mul, self.beta2)?;
            moments.v.add_assign(&grad.mul(&grad)?.mul_scalar(1.0 - self.beta2)?)?;

            let m_hat = moments.m.div_scalar(bias_correction1)?;
            let v_hat = moments.v.div_scalar(bias_correction2)?;
            let update = m_hat.mul_scalar(self.lr)?.div(&v_hat.sqrt()?.add_scalar(self.eps)?)?;
            param.value_mut().sub_assign(&update)?;
        }
        Ok(())
    }
}
