//! Linear (fully connected) layer.

use ad_tensor::prelude::*;

use crate::module::Module;

/// A linear (fully connected) layer: y = x @ W + b
pub struct Linear {
    /// Weight matrix [in_features, out_features]
    pub weight: Tensor,
    /// Bias row [1, out_features], broadcast over the batch
    pub bias: Tensor,
}

impl Linear {
    /// Create a layer on the CPU device with weights and bias drawn uniformly
    /// from [-1, 1).
    pub fn new(in_features: usize, out_features: usize) -> Result<Self> {
        Self::with_options(in_features, out_features, &TensorOptions::default())
    }

    /// Like [`Linear::new`], with the parameters' dtype and device taken from
    /// `options`. Parameters always require gradients.
    pub fn with_options(in_features: usize, out_features: usize, options: &TensorOptions) -> Result<Self> {
        let options = options.clone().requires_grad(true);
        let weight = randn([in_features, out_features], &options)?;
        let bias = randn([1, out_features], &options)?;
        Ok(Linear { weight, bias })
    }

    /// Create a linear layer from existing weight and bias tensors.
    pub fn from_tensors(weight: Tensor, bias: Tensor) -> Self {
        Linear { weight, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape().dim(0)
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape().dim(1)
    }
}

impl Module for Linear {
    /// Input x has shape [batch, in_features]; output is [batch, out_features].
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.matmul(&self.weight)? + &self.bias
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}
