//! The `Module` trait and sequential composition.

use std::sync::Arc;

use ad_tensor::prelude::*;

/// A differentiable building block owning an ordered list of parameters.
pub trait Module {
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Parameters in registration order. Handles share the module's nodes,
    /// so updating a returned tensor updates the module.
    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }

    /// Total element count of the parameters that require gradients.
    fn learnable_parameters(&self) -> usize {
        self.parameters()
            .iter()
            .filter(|p| p.requires_grad())
            .map(Tensor::numel)
            .sum()
    }

    fn zero_grad(&self) -> Result<()> {
        for param in self.parameters() {
            param.zero_grad()?;
        }
        Ok(())
    }

    /// Move every parameter, and any accumulated gradient, onto `device`.
    fn to(&self, device: Arc<dyn Device>) -> Result<()> {
        for param in self.parameters() {
            param.to(Arc::clone(&device))?;
        }
        Ok(())
    }
}

/// Applies its modules left to right.
#[derive(Default)]
pub struct Sequential {
    modules: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, module: impl Module + 'static) {
        self.modules.push(Box::new(module));
    }

    /// Builder form of [`Sequential::add`].
    pub fn with(mut self, module: impl Module + 'static) -> Self {
        self.add(module);
        self
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut out = x.clone();
        for module in &self.modules {
            out = module.forward(&out)?;
        }
        Ok(out)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.modules.iter().flat_map(|m| m.parameters()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Linear, Tanh};

    #[test]
    fn test_sequential_collects_parameters_in_order() {
        let first = Linear::new(2, 3).unwrap();
        let second = Linear::new(3, 1).unwrap();
        let ids = [first.weight.id(), first.bias.id(), second.weight.id(), second.bias.id()];

        let model = Sequential::new().with(first).with(Tanh).with(second);
        assert_eq!(model.len(), 3);
        let params = model.parameters();
        assert_eq!(params.iter().map(Tensor::id).collect::<Vec<_>>(), ids);
        assert_eq!(model.learnable_parameters(), 2 * 3 + 3 + 3 + 1);
    }

    #[test]
    fn test_frozen_parameters_are_not_learnable() {
        let layer = Linear::new(4, 2).unwrap();
        layer.bias.set_require_grad(false);
        assert_eq!(layer.learnable_parameters(), 8);
    }

    #[test]
    fn test_forward_threads_output() {
        let model = Sequential::new().with(Tanh).with(Tanh);
        let x = tensor(&[0.5f32], [1], &TensorOptions::default()).unwrap();
        let y = model.forward(&x).unwrap().to_vec::<f32>().unwrap();
        assert!((y[0] - 0.5f32.tanh().tanh()).abs() < 1e-6);
    }
}
