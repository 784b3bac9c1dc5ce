//! Device-resident multi-dimensional arrays.
//!
//! A [`TensorValue`] owns exactly one device buffer and knows its shape,
//! strides and element type. All arithmetic is delegated to the owning
//! [`Device`]; this module only validates shapes, promotes element types and
//! broadcasts operands before handing buffers to the kernels.

use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::buffer::Buffer;
use crate::device::{same_device, BinaryOp, Device, UnaryOp};
use crate::dtype::{DataType, Element};
use crate::error::Result;
use crate::invalid_arg;
use crate::shape::{Shape, Strides};

pub struct TensorValue {
    buffer: Buffer,
    shape: Shape,
    strides: Strides,
    device: Arc<dyn Device>,
}

impl TensorValue {
    // === Constructors ===

    /// Allocate storage for `shape` without initialising it. Buffers recycled
    /// by a caching device may hold stale elements.
    pub fn allocate(shape: impl Into<Shape>, dtype: DataType, device: Arc<dyn Device>) -> Result<Self> {
        let shape = shape.into();
        let buffer = device.allocate(shape.numel(), dtype)?;
        let strides = shape.contiguous_strides();
        Ok(TensorValue {
            buffer,
            shape,
            strides,
            device,
        })
    }

    /// Copy host data in, converting it to `dtype`.
    pub fn from_slice<T: Element>(
        data: &[T],
        shape: impl Into<Shape>,
        dtype: DataType,
        device: Arc<dyn Device>,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.numel() {
            return Err(invalid_arg!(
                "{} elements cannot fill a tensor of shape {}",
                data.len(),
                shape
            ));
        }
        let staging = Buffer::from_vec(data.to_vec());
        let value = TensorValue::allocate(shape, dtype, device)?;
        value.device.copy(&staging, &value.buffer, data.len())?;
        Ok(value)
    }

    pub fn full(value: f64, shape: impl Into<Shape>, dtype: DataType, device: Arc<dyn Device>) -> Result<Self> {
        let result = TensorValue::allocate(shape, dtype, device)?;
        result.device.fill(value, result.numel(), &result.buffer)?;
        Ok(result)
    }

    pub fn scalar(value: f64, dtype: DataType, device: Arc<dyn Device>) -> Result<Self> {
        TensorValue::full(value, Shape::scalar(), dtype, device)
    }

    pub fn zeros(shape: impl Into<Shape>, dtype: DataType, device: Arc<dyn Device>) -> Result<Self> {
        TensorValue::full(0.0, shape, dtype, device)
    }

    /// Deep copy into a fresh buffer on the same device.
    pub fn try_clone(&self) -> Result<Self> {
        let result = self.empty_like(self.shape.clone(), self.dtype())?;
        self.device.copy(&self.buffer, &result.buffer, self.numel())?;
        Ok(result)
    }

    fn empty_like(&self, shape: Shape, dtype: DataType) -> Result<Self> {
        TensorValue::allocate(shape, dtype, Arc::clone(&self.device))
    }

    // === Accessors ===

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &Strides {
        &self.strides
    }

    pub fn dtype(&self) -> DataType {
        self.buffer.dtype()
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_scalar()
    }

    /// Synchronize with the device and read every element as `T`.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.device.commit_and_wait()?;
        Ok(self.buffer.read().to_vec::<T>(self.numel()))
    }

    /// The single element of a 0-dimensional value.
    pub fn item<T: Element>(&self) -> Result<T> {
        if !self.is_scalar() {
            return Err(invalid_arg!(
                "item() requires a scalar tensor, found shape {}",
                self.shape
            ));
        }
        self.to_vec::<T>()?
            .first()
            .copied()
            .ok_or_else(|| invalid_arg!("scalar tensor holds no element"))
    }

    /// Native-endian bytes of every element at this value's element width.
    pub fn to_ne_bytes(&self) -> Result<Vec<u8>> {
        self.device.commit_and_wait()?;
        Ok(self.buffer.read().to_ne_bytes(self.numel()))
    }

    /// Overwrite the elements from native-endian bytes at this value's width.
    pub fn copy_from_ne_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let expected = self.numel() * self.dtype().size();
        if bytes.len() != expected {
            return Err(invalid_arg!(
                "expected {} bytes for shape {}, got {}",
                expected,
                self.shape,
                bytes.len()
            ));
        }
        self.device.commit_and_wait()?;
        self.buffer.write().copy_from_ne_bytes(bytes)
    }

    fn check_same_device(&self, other: &TensorValue) -> Result<()> {
        if !same_device(&self.device, &other.device) {
            return Err(invalid_arg!(
                "operands live on different devices: {:?} and {:?}",
                self.device,
                other.device
            ));
        }
        Ok(())
    }

    /// Cast and broadcast into `dtype`/`shape`. `None` when already conforming.
    fn conform(&self, dtype: DataType, shape: &Shape) -> Result<Option<TensorValue>> {
        let cast = if self.dtype() != dtype {
            Some(self.to_dtype(dtype)?)
        } else {
            None
        };
        let source = cast.as_ref().unwrap_or(self);
        if &source.shape != shape {
            return Ok(Some(source.broadcast_to(shape.clone())?));
        }
        Ok(cast)
    }

    // === Element-wise arithmetic ===

    /// Promote and broadcast both operands, then apply `op` element-wise.
    pub fn binary(&self, op: BinaryOp, other: &TensorValue) -> Result<TensorValue> {
        self.check_same_device(other)?;
        let dtype = self.dtype().promote(other.dtype());
        let shape = if self.shape == other.shape {
            self.shape.clone()
        } else {
            self.shape.broadcast_with(&other.shape)?
        };

        let lhs = self.conform(dtype, &shape)?;
        let rhs = other.conform(dtype, &shape)?;
        let a = lhs.as_ref().unwrap_or(self);
        let b = rhs.as_ref().unwrap_or(other);

        let result = self.empty_like(shape, dtype)?;
        self.device.binary(op, &a.buffer, &b.buffer, result.numel(), &result.buffer)?;
        Ok(result)
    }

    /// In-place `self = self <op> other`. `other` is broadcast to this value's
    /// shape and cast to its element type; the shape of `self` never changes.
    pub fn binary_assign(&mut self, op: BinaryOp, other: &TensorValue) -> Result<()> {
        self.check_same_device(other)?;
        other.shape.check_broadcast_to(&self.shape)?;
        let rhs = other.conform(self.dtype(), &self.shape)?;
        let b = rhs.as_ref().unwrap_or(other);
        self.device
            .binary(op, &self.buffer, &b.buffer, self.numel(), &self.buffer)
    }

    pub fn add(&self, other: &TensorValue) -> Result<TensorValue> {
        self.binary(BinaryOp::Add, other)
    }

    pub fn sub(&self, other: &TensorValue) -> Result<TensorValue> {
        self.binary(BinaryOp::Sub, other)
    }

    pub fn mul(&self, other: &TensorValue) -> Result<TensorValue> {
        self.binary(BinaryOp::Mul, other)
    }

    pub fn div(&self, other: &TensorValue) -> Result<TensorValue> {
        self.binary(BinaryOp::Div, other)
    }

    pub fn pow(&self, exponent: &TensorValue) -> Result<TensorValue> {
        self.binary(BinaryOp::Pow, exponent)
    }

    pub fn add_assign(&mut self, other: &TensorValue) -> Result<()> {
        self.binary_assign(BinaryOp::Add, other)
    }

    pub fn sub_assign(&mut self, other: &TensorValue) -> Result<()> {
        self.binary_assign(BinaryOp::Sub, other)
    }

    pub fn mul_assign(&mut self, other: &TensorValue) -> Result<()> {
        self.binary_assign(BinaryOp::Mul, other)
    }

    pub fn div_assign(&mut self, other: &TensorValue) -> Result<()> {
        self.binary_assign(BinaryOp::Div, other)
    }

    // === Scalar arithmetic ===

    /// `self <op> scalar`
    pub fn binary_scalar(&self, op: BinaryOp, scalar: f64) -> Result<TensorValue> {
        let result = self.empty_like(self.shape.clone(), self.dtype())?;
        self.device
            .binary_scalar(op, &self.buffer, scalar, self.numel(), &result.buffer)?;
        Ok(result)
    }

    /// `scalar <op> self`
    pub fn scalar_binary(&self, op: BinaryOp, scalar: f64) -> Result<TensorValue> {
        let result = self.empty_like(self.shape.clone(), self.dtype())?;
        self.device
            .scalar_binary(op, scalar, &self.buffer, self.numel(), &result.buffer)?;
        Ok(result)
    }

    pub fn binary_scalar_assign(&mut self, op: BinaryOp, scalar: f64) -> Result<()> {
        self.device
            .binary_scalar(op, &self.buffer, scalar, self.numel(), &self.buffer)
    }

    pub fn add_scalar(&self, scalar: f64) -> Result<TensorValue> {
        self.binary_scalar(BinaryOp::Add, scalar)
    }

    pub fn sub_scalar(&self, scalar: f64) -> Result<TensorValue> {
        self.binary_scalar(BinaryOp::Sub, scalar)
    }

    pub fn mul_scalar(&self, scalar: f64) -> Result<TensorValue> {
        self.binary_scalar(BinaryOp::Mul, scalar)
    }

    pub fn div_scalar(&self, scalar: f64) -> Result<TensorValue> {
        self.binary_scalar(BinaryOp::Div, scalar)
    }

    pub fn pow_scalar(&self, exponent: f64) -> Result<TensorValue> {
        self.binary_scalar(BinaryOp::Pow, exponent)
    }

    /// `scalar - self`
    pub fn rsub_scalar(&self, scalar: f64) -> Result<TensorValue> {
        self.scalar_binary(BinaryOp::Sub, scalar)
    }

    /// `scalar / self`
    pub fn rdiv_scalar(&self, scalar: f64) -> Result<TensorValue> {
        self.scalar_binary(BinaryOp::Div, scalar)
    }

    // === Unary math ===

    pub fn unary(&self, op: UnaryOp) -> Result<TensorValue> {
        let result = self.empty_like(self.shape.clone(), self.dtype())?;
        self.device
            .unary(op, &self.buffer, self.numel(), &result.buffer)?;
        Ok(result)
    }

    pub fn neg(&self) -> Result<TensorValue> {
        self.unary(UnaryOp::Neg)
    }

    pub fn sqrt(&self) -> Result<TensorValue> {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn sin(&self) -> Result<TensorValue> {
        self.unary(UnaryOp::Sin)
    }

    pub fn cos(&self) -> Result<TensorValue> {
        self.unary(UnaryOp::Cos)
    }

    pub fn tanh(&self) -> Result<TensorValue> {
        self.unary(UnaryOp::Tanh)
    }

    pub fn log(&self) -> Result<TensorValue> {
        self.unary(UnaryOp::Log)
    }

    pub fn exp(&self) -> Result<TensorValue> {
        self.unary(UnaryOp::Exp)
    }

    /// Set every element to `value`.
    pub fn fill(&mut self, value: f64) -> Result<()> {
        self.device.fill(value, self.numel(), &self.buffer)
    }

    // === Reductions ===

    /// Sum of all elements as a scalar.
    pub fn sum(&self) -> Result<TensorValue> {
        let result = self.empty_like(Shape::scalar(), self.dtype())?;
        self.device.sum(&self.buffer, self.numel(), &result.buffer)?;
        Ok(result)
    }

    /// Mean of all elements as a scalar.
    pub fn mean(&self) -> Result<TensorValue> {
        let result = self.empty_like(Shape::scalar(), self.dtype())?;
        self.device.mean(&self.buffer, self.numel(), &result.buffer)?;
        Ok(result)
    }

    /// Sum along `dim`, keeping it as a size-1 axis when `keep_dim` is set.
    pub fn sum_dim(&self, dim: usize, keep_dim: bool) -> Result<TensorValue> {
        if dim >= self.ndim() {
            return Err(invalid_arg!("sum dim {} out of range for shape {}", dim, self.shape));
        }
        let mut dims = self.shape.dims().to_vec();
        dims[dim] = 1;
        let kept = self.reduce_to(Shape::new(dims))?;
        if keep_dim {
            Ok(kept)
        } else {
            kept.reshape(kept.shape.squeezed(dim)?)
        }
    }

    // === Linear algebra and layout ===

    /// 2-D matrix product. Operands are promoted to a common element type.
    pub fn matmul(&self, other: &TensorValue) -> Result<TensorValue> {
        self.check_same_device(other)?;
        if self.ndim() != 2 || other.ndim() != 2 {
            return Err(invalid_arg!(
                "matmul requires 2-D tensors, got {} and {}",
                self.shape,
                other.shape
            ));
        }
        if self.shape.dim(1) != other.shape.dim(0) {
            return Err(invalid_arg!(
                "matmul inner dimensions differ: {} and {}",
                self.shape,
                other.shape
            ));
        }

        let dtype = self.dtype().promote(other.dtype());
        let lhs = self.conform(dtype, &self.shape)?;
        let rhs = other.conform(dtype, &other.shape)?;
        let a = lhs.as_ref().unwrap_or(self);
        let b = rhs.as_ref().unwrap_or(other);

        let result = self.empty_like(Shape::from([self.shape.dim(0), other.shape.dim(1)]), dtype)?;
        self.device
            .matmul(&a.buffer, &a.shape, &b.buffer, &b.shape, &result.buffer)?;
        Ok(result)
    }

    /// Swap axes `dim0` and `dim1`.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<TensorValue> {
        if dim0 >= self.ndim() || dim1 >= self.ndim() {
            return Err(invalid_arg!(
                "transpose dims ({}, {}) out of range for shape {}",
                dim0,
                dim1,
                self.shape
            ));
        }
        let mut dims = self.shape.dims().to_vec();
        dims.swap(dim0, dim1);
        let result = self.empty_like(Shape::new(dims), self.dtype())?;
        self.device.transpose(
            dim0,
            dim1,
            &self.buffer,
            &self.shape,
            &self.strides,
            &result.strides,
            self.numel(),
            &result.buffer,
        )?;
        Ok(result)
    }

    /// Same elements under a new shape with an equal element count.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<TensorValue> {
        let shape = shape.into();
        if shape.numel() != self.numel() {
            return Err(invalid_arg!("cannot reshape {} into {}", self.shape, shape));
        }
        let result = self.empty_like(shape, self.dtype())?;
        self.device.copy(&self.buffer, &result.buffer, self.numel())?;
        Ok(result)
    }

    pub fn broadcast_to(&self, shape: impl Into<Shape>) -> Result<TensorValue> {
        let shape = shape.into();
        self.shape.check_broadcast_to(&shape)?;
        let result = self.empty_like(shape, self.dtype())?;
        self.device
            .broadcast_to(&self.buffer, &self.shape, &result.shape, &result.buffer)?;
        Ok(result)
    }

    /// Sum broadcast axes away until the value has `shape`.
    pub fn reduce_to(&self, shape: impl Into<Shape>) -> Result<TensorValue> {
        let shape = shape.into();
        shape.check_broadcast_to(&self.shape)?;
        let result = self.empty_like(shape, self.dtype())?;
        self.device
            .reduce_to(&self.buffer, &self.shape, &result.shape, &result.buffer)?;
        Ok(result)
    }

    pub fn to_dtype(&self, dtype: DataType) -> Result<TensorValue> {
        let result = self.empty_like(self.shape.clone(), dtype)?;
        self.device.copy(&self.buffer, &result.buffer, self.numel())?;
        Ok(result)
    }

    /// Copy onto `device`, keeping shape and element type.
    pub fn to_device(&self, device: Arc<dyn Device>) -> Result<TensorValue> {
        self.device.commit_and_wait()?;
        debug!(
            "moving {} {} value from {:?} to {:?}",
            self.shape,
            self.dtype(),
            self.device.kind(),
            device.kind()
        );
        let result = TensorValue::allocate(self.shape.clone(), self.dtype(), device)?;
        result
            .device
            .copy_immediate(&self.buffer, &result.buffer, self.numel())?;
        Ok(result)
    }
}

impl Drop for TensorValue {
    fn drop(&mut self) {
        self.device.deallocate(self.buffer.clone());
    }
}

impl fmt::Debug for TensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorValue")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype())
            .field("buffer", &self.buffer)
            .finish()
    }
}

// === Printing ===

/// Format like C's `%g`: six significant digits, trailing zeros dropped,
/// scientific notation for very small or large magnitudes.
pub(crate) fn format_number(v: f64) -> String {
    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if v == 0.0 {
        return if v.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let sci = format!("{:.5e}", v);
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return sci;
    };
    let exp: i32 = exp.parse().unwrap_or(0);
    if !(-4..6).contains(&exp) {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_fraction(mantissa), sign, exp.abs())
    } else {
        let decimals = (5 - exp).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, v))
    }
}

fn trim_fraction(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

impl fmt::Display for TensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.to_vec::<f64>().map_err(|_| fmt::Error)?;
        let dims = self.shape.dims();

        match dims.len() {
            0 => write!(f, "{}\n\n", format_number(data[0]))?,
            1 => {
                for v in &data {
                    writeln!(f, "  {}", format_number(*v))?;
                }
                writeln!(f)?;
            }
            rank => {
                let rows = dims[rank - 2];
                let cols = dims[rank - 1];
                let slice = rows * cols;
                let outer = &dims[..rank - 2];
                let outer_strides = Shape::from(outer).contiguous_strides();
                let slices = if slice == 0 { 0 } else { data.len() / slice };

                for s in 0..slices {
                    if rank > 2 {
                        let index = outer_strides.unflatten(s);
                        let header: Vec<String> = index.iter().map(|i| i.to_string()).collect();
                        writeln!(f, "({},.,.) =", header.join(","))?;
                    }
                    for r in 0..rows {
                        for c in 0..cols {
                            write!(f, "  {}", format_number(data[s * slice + r * cols + c]))?;
                        }
                        writeln!(f)?;
                    }
                    writeln!(f)?;
                }
            }
        }

        let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
        writeln!(f, "[ {}{{{}}} ]", self.dtype().name(), dims.join(","))
    }
}
