//! Tensor constructors.

use std::sync::Arc;

use crate::device::{cpu_device, Device};
use crate::dtype::{DataType, Element};
use crate::error::Result;
use crate::node::Tensor;
use crate::random;
use crate::shape::Shape;
use crate::value::TensorValue;

/// Options shared by every constructor.
#[derive(Debug, Clone)]
pub struct TensorOptions {
    pub require_grad: bool,
    pub dtype: DataType,
    pub device: Arc<dyn Device>,
}

impl Default for TensorOptions {
    fn default() -> Self {
        TensorOptions {
            require_grad: false,
            dtype: DataType::default(),
            device: cpu_device(),
        }
    }
}

impl TensorOptions {
    pub fn requires_grad(mut self, require_grad: bool) -> Self {
        self.require_grad = require_grad;
        self
    }

    pub fn dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn device(mut self, device: Arc<dyn Device>) -> Self {
        self.device = device;
        self
    }
}

/// Tensor holding `data` laid out in row-major order over `shape`.
pub fn tensor<T: Element>(data: &[T], shape: impl Into<Shape>, options: &TensorOptions) -> Result<Tensor> {
    let value = TensorValue::from_slice(data, shape, options.dtype, Arc::clone(&options.device))?;
    Ok(Tensor::from_value(value, options.require_grad))
}

/// 1-D tensor over `data`.
pub fn tensor_with<T: Element>(data: &[T], options: &TensorOptions) -> Result<Tensor> {
    tensor(data, [data.len()], options)
}

/// 0-dimensional tensor.
pub fn scalar(value: f64, options: &TensorOptions) -> Result<Tensor> {
    full(value, Shape::scalar(), options)
}

pub fn full(value: f64, shape: impl Into<Shape>, options: &TensorOptions) -> Result<Tensor> {
    let value = TensorValue::full(value, shape, options.dtype, Arc::clone(&options.device))?;
    Ok(Tensor::from_value(value, options.require_grad))
}

pub fn ones(shape: impl Into<Shape>, options: &TensorOptions) -> Result<Tensor> {
    full(1.0, shape, options)
}

pub fn zeros(shape: impl Into<Shape>, options: &TensorOptions) -> Result<Tensor> {
    full(0.0, shape, options)
}

/// Ones with the shape, type and device of `like`.
pub fn ones_like(like: &Tensor, require_grad: bool) -> Result<Tensor> {
    full(1.0, like.shape(), &options_like(like, require_grad))
}

pub fn zeros_like(like: &Tensor, require_grad: bool) -> Result<Tensor> {
    full(0.0, like.shape(), &options_like(like, require_grad))
}

fn options_like(like: &Tensor, require_grad: bool) -> TensorOptions {
    TensorOptions {
        require_grad,
        dtype: like.dtype(),
        device: like.device(),
    }
}

/// Samples drawn uniformly from `[-1, 1)`.
pub fn randn(shape: impl Into<Shape>, options: &TensorOptions) -> Result<Tensor> {
    let shape = shape.into();
    let data = random::uniform(shape.numel(), -1.0, 1.0);
    tensor(&data, shape, options)
}
