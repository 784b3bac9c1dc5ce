//! Device trait - abstraction for compute devices.
//!
//! A device owns no tensor state. It allocates buffers and runs kernels over
//! them on behalf of [`crate::TensorValue`]. Every operation has a default,
//! synchronous CPU implementation in [`crate::kernels`]; accelerator devices
//! override the subset they can run and fall back to the kernels otherwise.

use std::fmt;
use std::sync::Arc;

use num_traits::Float;
use once_cell::sync::Lazy;

use crate::buffer::Buffer;
use crate::dtype::DataType;
use crate::error::Result;
use crate::kernels;
use crate::shape::{Shape, Strides};

/// Which implementation backs a device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceKind {
    /// Synchronous reference implementation.
    #[default]
    Cpu,
    /// Batched, asynchronously executed command queue.
    Batched,
}

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    #[inline]
    pub fn apply<T: Float>(self, x: T, y: T) -> T {
        match self {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Pow => x.powf(y),
        }
    }
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Sqrt,
    Sin,
    Cos,
    Tanh,
    Log,
    Exp,
}

impl UnaryOp {
    #[inline]
    pub fn apply<T: Float>(self, x: T) -> T {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Sin => x.sin(),
            UnaryOp::Cos => x.cos(),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Exp => x.exp(),
        }
    }
}

/// Compute device. Kernels read `size` elements from their inputs and write
/// them into the caller-provided `result`, which may alias an input for
/// in-place updates.
pub trait Device: Send + Sync + fmt::Debug {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn data_type_size(&self, dtype: DataType) -> usize {
        dtype.size()
    }

    // === Memory ===

    fn allocate(&self, size: usize, dtype: DataType) -> Result<Buffer> {
        Buffer::try_new(size, dtype)
    }

    fn deallocate(&self, buffer: Buffer) {
        drop(buffer);
    }

    // === Element-wise ===

    fn binary(&self, op: BinaryOp, a: &Buffer, b: &Buffer, size: usize, result: &Buffer) -> Result<()> {
        kernels::binary(op, a, b, size, result)
    }

    /// `result = a <op> scalar`
    fn binary_scalar(
        &self,
        op: BinaryOp,
        a: &Buffer,
        scalar: f64,
        size: usize,
        result: &Buffer,
    ) -> Result<()> {
        kernels::binary_scalar(op, a, scalar, size, result)
    }

    /// `result = scalar <op> a`
    fn scalar_binary(
        &self,
        op: BinaryOp,
        scalar: f64,
        a: &Buffer,
        size: usize,
        result: &Buffer,
    ) -> Result<()> {
        kernels::scalar_binary(op, scalar, a, size, result)
    }

    fn unary(&self, op: UnaryOp, a: &Buffer, size: usize, result: &Buffer) -> Result<()> {
        kernels::unary(op, a, size, result)
    }

    fn fill(&self, scalar: f64, size: usize, result: &Buffer) -> Result<()> {
        kernels::fill(scalar, size, result)
    }

    // === Reductions ===

    fn sum(&self, a: &Buffer, size: usize, result: &Buffer) -> Result<()> {
        kernels::sum(a, size, result)
    }

    fn mean(&self, a: &Buffer, size: usize, result: &Buffer) -> Result<()> {
        kernels::mean(a, size, result)
    }

    // === Linear algebra and layout ===

    fn matmul(
        &self,
        a: &Buffer,
        shape_a: &Shape,
        b: &Buffer,
        shape_b: &Shape,
        result: &Buffer,
    ) -> Result<()> {
        kernels::matmul(a, shape_a, b, shape_b, result)
    }

    #[allow(clippy::too_many_arguments)]
    fn transpose(
        &self,
        dim0: usize,
        dim1: usize,
        data: &Buffer,
        shape: &Shape,
        old_strides: &Strides,
        new_strides: &Strides,
        size: usize,
        result: &Buffer,
    ) -> Result<()> {
        kernels::transpose(dim0, dim1, data, shape, old_strides, new_strides, size, result)
    }

    /// Converting copy from `src` into `dst`.
    fn copy(&self, src: &Buffer, dst: &Buffer, size: usize) -> Result<()> {
        kernels::copy(src, dst, size)
    }

    /// Converting copy followed by a synchronization barrier.
    fn copy_immediate(&self, src: &Buffer, dst: &Buffer, size: usize) -> Result<()> {
        self.copy(src, dst, size)?;
        self.commit_and_wait()
    }

    fn broadcast_to(&self, src: &Buffer, shape: &Shape, new_shape: &Shape, result: &Buffer) -> Result<()> {
        kernels::broadcast_to(src, shape, new_shape, result)
    }

    /// Sum `src` (of `shape`) down into `result` (of the smaller `new_shape`).
    fn reduce_to(&self, src: &Buffer, shape: &Shape, new_shape: &Shape, result: &Buffer) -> Result<()> {
        kernels::reduce_to(src, shape, new_shape, result)
    }

    // === Synchronization ===

    /// Flush queued work and block until it completes. No-op on synchronous devices.
    fn commit_and_wait(&self) -> Result<()> {
        Ok(())
    }
}

/// The reference device: every operation runs synchronously on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuDevice;

impl Device for CpuDevice {}

static CPU_DEVICE: Lazy<Arc<dyn Device>> = Lazy::new(|| Arc::new(CpuDevice));

/// Shared handle to the process-wide CPU device.
pub fn cpu_device() -> Arc<dyn Device> {
    Arc::clone(&CPU_DEVICE)
}

/// True when both handles point at the same device instance.
pub fn same_device(a: &Arc<dyn Device>, b: &Arc<dyn Device>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
