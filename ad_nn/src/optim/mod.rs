//! Optimizers for neural network training.
//!
//! An optimizer holds handles to the parameters it updates. Handles share
//! their graph node with the owning module, so `step` mutates the module's
//! parameters in place.

mod adam;
mod sgd;

pub use adam::Adam;
pub use sgd::SGD;

use ad_tensor::prelude::*;

pub trait Optimizer {
    /// The parameters this optimizer updates, in registration order.
    fn parameters(&self) -> &[Tensor];

    /// Apply one update using the currently accumulated gradients.
    fn step(&mut self) -> Result<()>;

    /// Reset every parameter's accumulated gradient to zero.
    fn zero_grad(&self) -> Result<()> {
        for param in self.parameters() {
            param.zero_grad()?;
        }
        Ok(())
    }
}
