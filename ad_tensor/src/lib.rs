//! # ad_tensor - Tensor Autodiff with Pluggable Devices
//!
//! This crate provides a tensor-based reverse-mode automatic differentiation engine
//! whose kernels run on a pluggable compute [`Device`].
//!
//! ## Overview
//!
//! The core abstractions are:
//! - [`Shape`] and [`Strides`] - Tensor shape and memory layout
//! - [`DataType`] - Element kinds and their promotion table
//! - [`Device`] - Trait for compute devices; [`CpuDevice`] is the synchronous reference
//! - [`TensorValue`] - A device-resident array owning one buffer
//! - [`Tensor`] - Reference-counted handle to a computation graph node
//!
//! ## Example
//!
//! ```
//! use ad_tensor::prelude::*;
//!
//! # fn main() -> ad_tensor::Result<()> {
//! let opts = TensorOptions::default().requires_grad(true);
//! let x = tensor(&[1.0f32, 2.0, 3.0], [3], &opts)?;
//! let y = tensor(&[4.0f32, 5.0, 6.0], [3], &opts)?;
//!
//! // z = sum(x * y + exp(x))
//! let z = ((&x * &y) + x.exp()?)?.sum()?;
//! z.backward()?;
//!
//! let dx = x.grad()?.to_vec::<f32>()?;
//! assert!((dx[0] - (4.0 + 1f32.exp())).abs() < 1e-4);
//! # Ok(())
//! # }
//! ```

mod backward;
pub mod buffer;
pub mod creation;
pub mod device;
pub mod dtype;
pub mod error;
pub mod finite_diff;
pub mod kernels;
pub mod node;
pub mod random;
pub mod shape;
pub mod value;

pub use buffer::{Buffer, Storage};
pub use creation::{full, ones, ones_like, randn, scalar, tensor, tensor_with, zeros, zeros_like, TensorOptions};
pub use device::{cpu_device, same_device, BinaryOp, CpuDevice, Device, DeviceKind, UnaryOp};
pub use dtype::{DataType, Element};
pub use error::{Result, TensorError};
pub use node::{NodeId, Tensor, TensorOp};
pub use random::manual_seed;
pub use shape::{Shape, Strides};
pub use value::TensorValue;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::creation::{
        full, ones, ones_like, randn, scalar, tensor, tensor_with, zeros, zeros_like, TensorOptions,
    };
    pub use crate::device::{cpu_device, Device, DeviceKind};
    pub use crate::dtype::DataType;
    pub use crate::error::{Result, TensorError};
    pub use crate::node::{NodeId, Tensor, TensorOp};
    pub use crate::shape::{Shape, Strides};
    pub use crate::value::TensorValue;
}
