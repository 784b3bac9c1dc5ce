//! Loss functions.

use ad_tensor::prelude::*;

/// A scalar objective comparing predictions against targets.
pub trait Loss {
    fn forward(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor>;
}

/// Mean Squared Error loss: mean((pred - target)^2)
pub fn mse_loss(predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let diff = (predictions - targets)?;
    (&diff * &diff)?.mean()
}

/// Binary Cross-Entropy on probabilities:
/// -mean(t * log(p) + (1 - t) * log(1 - p))
///
/// Predictions must lie strictly inside (0, 1); no clamping is applied.
pub fn binary_cross_entropy_loss(predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let positive = (targets * predictions.log()?)?;
    let negative = (targets.rsub_scalar(1.0)? * predictions.rsub_scalar(1.0)?.log()?)?;
    (positive + negative)?.mean()?.neg()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MSELoss;

impl Loss for MSELoss {
    fn forward(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
        mse_loss(predictions, targets)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCrossEntropyLoss;

impl Loss for BinaryCrossEntropyLoss {
    fn forward(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
        binary_cross_entropy_loss(predictions, targets)
    }
}
