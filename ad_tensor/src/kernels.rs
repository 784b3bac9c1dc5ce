//! Reference CPU kernels backing the default [`crate::Device`] methods.
//!
//! Every kernel validates that its buffers share an element type and hold at
//! least `size` elements. A result buffer may alias an input; the aliased
//! input is snapshotted before the result is written.

use num_traits::Zero;
use parking_lot::RwLockReadGuard;

use crate::buffer::{Buffer, Storage};
use crate::device::{BinaryOp, UnaryOp};
use crate::dtype::Element;
use crate::error::Result;
use crate::invalid_arg;
use crate::shape::{translation_index, Shape, Strides};

/// Read access to a kernel input that may alias the result buffer.
enum Input<'a> {
    Shared(RwLockReadGuard<'a, Storage>),
    Snapshot(Storage),
}

impl Input<'_> {
    fn storage(&self) -> &Storage {
        match self {
            Input::Shared(guard) => &**guard,
            Input::Snapshot(storage) => storage,
        }
    }
}

fn input<'a>(buf: &'a Buffer, result: &Buffer) -> Input<'a> {
    if buf.same(result) {
        Input::Snapshot(buf.read().clone())
    } else {
        Input::Shared(buf.read())
    }
}

/// `buf` must hold at least `size` elements.
pub fn check_capacity(buf: &Buffer, size: usize, role: &str) -> Result<()> {
    if buf.len() < size {
        return Err(invalid_arg!(
            "{} buffer holds {} elements, kernel needs {}",
            role,
            buf.len(),
            size
        ));
    }
    Ok(())
}

/// Every input must share the result's element type.
pub fn check_dtypes(inputs: &[&Buffer], result: &Buffer) -> Result<()> {
    for buf in inputs {
        if buf.dtype() != result.dtype() {
            return Err(invalid_arg!(
                "kernel operands must share a data type: {} vs {}",
                buf.dtype(),
                result.dtype()
            ));
        }
    }
    Ok(())
}

// === Element-wise ===

pub fn binary(op: BinaryOp, a: &Buffer, b: &Buffer, size: usize, result: &Buffer) -> Result<()> {
    check_dtypes(&[a, b], result)?;
    check_capacity(a, size, "lhs")?;
    check_capacity(b, size, "rhs")?;
    check_capacity(result, size, "result")?;

    let lhs = input(a, result);
    let rhs = input(b, result);
    let mut out = result.write();
    crate::dispatch_dtype!(result.dtype(), T => {
        let x = lhs.storage().typed::<T>()?;
        let y = rhs.storage().typed::<T>()?;
        let o = out.typed_mut::<T>()?;
        for ((o, &x), &y) in o[..size].iter_mut().zip(&x[..size]).zip(&y[..size]) {
            *o = op.apply(x, y);
        }
    });
    Ok(())
}

pub fn binary_scalar(op: BinaryOp, a: &Buffer, scalar: f64, size: usize, result: &Buffer) -> Result<()> {
    check_dtypes(&[a], result)?;
    check_capacity(a, size, "input")?;
    check_capacity(result, size, "result")?;

    let lhs = input(a, result);
    let mut out = result.write();
    crate::dispatch_dtype!(result.dtype(), T => {
        let s = T::from_f64(scalar);
        let x = lhs.storage().typed::<T>()?;
        let o = out.typed_mut::<T>()?;
        for (o, &x) in o[..size].iter_mut().zip(&x[..size]) {
            *o = op.apply(x, s);
        }
    });
    Ok(())
}

pub fn scalar_binary(op: BinaryOp, scalar: f64, a: &Buffer, size: usize, result: &Buffer) -> Result<()> {
    check_dtypes(&[a], result)?;
    check_capacity(a, size, "input")?;
    check_capacity(result, size, "result")?;

    let rhs = input(a, result);
    let mut out = result.write();
    crate::dispatch_dtype!(result.dtype(), T => {
        let s = T::from_f64(scalar);
        let x = rhs.storage().typed::<T>()?;
        let o = out.typed_mut::<T>()?;
        for (o, &x) in o[..size].iter_mut().zip(&x[..size]) {
            *o = op.apply(s, x);
        }
    });
    Ok(())
}

pub fn unary(op: UnaryOp, a: &Buffer, size: usize, result: &Buffer) -> Result<()> {
    check_dtypes(&[a], result)?;
    check_capacity(a, size, "input")?;
    check_capacity(result, size, "result")?;

    let src = input(a, result);
    let mut out = result.write();
    crate::dispatch_dtype!(result.dtype(), T => {
        let x = src.storage().typed::<T>()?;
        let o = out.typed_mut::<T>()?;
        for (o, &x) in o[..size].iter_mut().zip(&x[..size]) {
            *o = op.apply(x);
        }
    });
    Ok(())
}

pub fn fill(scalar: f64, size: usize, result: &Buffer) -> Result<()> {
    check_capacity(result, size, "result")?;
    let mut out = result.write();
    crate::dispatch_dtype!(result.dtype(), T => {
        out.typed_mut::<T>()?[..size].fill(T::from_f64(scalar));
    });
    Ok(())
}

// === Reductions ===

fn total<T: Element>(a: &Buffer, size: usize, result: &Buffer) -> Result<T> {
    check_dtypes(&[a], result)?;
    check_capacity(a, size, "input")?;
    check_capacity(result, 1, "result")?;
    let src = a.read();
    Ok(src.typed::<T>()?[..size].iter().fold(T::zero(), |acc, &x| acc + x))
}

pub fn sum(a: &Buffer, size: usize, result: &Buffer) -> Result<()> {
    crate::dispatch_dtype!(result.dtype(), T => {
        let value = total::<T>(a, size, result)?;
        result.write().typed_mut::<T>()?[0] = value;
    });
    Ok(())
}

pub fn mean(a: &Buffer, size: usize, result: &Buffer) -> Result<()> {
    crate::dispatch_dtype!(result.dtype(), T => {
        let value = total::<T>(a, size, result)? / T::from_f64(size as f64);
        result.write().typed_mut::<T>()?[0] = value;
    });
    Ok(())
}

// === Linear algebra and layout ===

pub fn matmul(a: &Buffer, shape_a: &Shape, b: &Buffer, shape_b: &Shape, result: &Buffer) -> Result<()> {
    if shape_a.ndim() != 2 || shape_b.ndim() != 2 {
        return Err(invalid_arg!(
            "matmul requires 2-D operands, got {} and {}",
            shape_a,
            shape_b
        ));
    }
    let (m, k) = (shape_a.dim(0), shape_a.dim(1));
    let (k2, n) = (shape_b.dim(0), shape_b.dim(1));
    if k != k2 {
        return Err(invalid_arg!(
            "matmul inner dimensions differ: {} vs {}",
            shape_a,
            shape_b
        ));
    }
    check_dtypes(&[a, b], result)?;
    check_capacity(a, m * k, "lhs")?;
    check_capacity(b, k * n, "rhs")?;
    check_capacity(result, m * n, "result")?;

    let lhs = input(a, result);
    let rhs = input(b, result);
    let mut out = result.write();
    crate::dispatch_dtype!(result.dtype(), T => {
        let x = lhs.storage().typed::<T>()?;
        let y = rhs.storage().typed::<T>()?;
        let o = out.typed_mut::<T>()?;
        o[..m * n].fill(T::zero());
        for i in 0..m {
            for p in 0..k {
                let x_ip = x[i * k + p];
                for j in 0..n {
                    o[i * n + j] = o[i * n + j] + x_ip * y[p * n + j];
                }
            }
        }
    });
    Ok(())
}

/// Swap axes `dim0` and `dim1` by recomputing every element's flat index.
#[allow(clippy::too_many_arguments)]
pub fn transpose(
    dim0: usize,
    dim1: usize,
    data: &Buffer,
    shape: &Shape,
    old_strides: &Strides,
    new_strides: &Strides,
    size: usize,
    result: &Buffer,
) -> Result<()> {
    if dim0 >= shape.ndim() || dim1 >= shape.ndim() {
        return Err(invalid_arg!(
            "transpose dims ({}, {}) out of range for shape {}",
            dim0,
            dim1,
            shape
        ));
    }
    check_dtypes(&[data], result)?;
    check_capacity(data, size, "input")?;
    check_capacity(result, size, "result")?;

    let src = input(data, result);
    let mut out = result.write();
    crate::dispatch_dtype!(result.dtype(), T => {
        let x = src.storage().typed::<T>()?;
        let o = out.typed_mut::<T>()?;
        for (i, &value) in x[..size].iter().enumerate() {
            let mut index = old_strides.unflatten(i);
            index.swap(dim0, dim1);
            o[new_strides.index(&index)] = value;
        }
    });
    Ok(())
}

/// Element-converting copy of the first `size` elements.
pub fn copy(src: &Buffer, dst: &Buffer, size: usize) -> Result<()> {
    check_capacity(src, size, "source")?;
    check_capacity(dst, size, "destination")?;
    if src.same(dst) {
        return Ok(());
    }

    let from = src.read();
    let mut to = dst.write();
    crate::dispatch_dtype!(src.dtype(), S => crate::dispatch_dtype!(dst.dtype(), D => {
        let x = from.typed::<S>()?;
        let o = to.typed_mut::<D>()?;
        for (o, &x) in o[..size].iter_mut().zip(&x[..size]) {
            *o = D::from_f64(x.as_f64());
        }
    }));
    Ok(())
}

pub fn broadcast_to(src: &Buffer, shape: &Shape, new_shape: &Shape, result: &Buffer) -> Result<()> {
    shape.check_broadcast_to(new_shape)?;
    let size = new_shape.numel();
    check_dtypes(&[src], result)?;
    check_capacity(src, shape.numel(), "source")?;
    check_capacity(result, size, "result")?;

    let from = input(src, result);
    let mut out = result.write();
    crate::dispatch_dtype!(result.dtype(), T => {
        let x = from.storage().typed::<T>()?;
        let o = out.typed_mut::<T>()?;
        for (i, o) in o[..size].iter_mut().enumerate() {
            *o = x[translation_index(i, shape.dims(), new_shape.dims())];
        }
    });
    Ok(())
}

/// Adjoint of [`broadcast_to`]: accumulate every element of `src` into the
/// position of `new_shape` it would have been broadcast from.
pub fn reduce_to(src: &Buffer, shape: &Shape, new_shape: &Shape, result: &Buffer) -> Result<()> {
    new_shape.check_broadcast_to(shape)?;
    let size = shape.numel();
    check_dtypes(&[src], result)?;
    check_capacity(src, size, "source")?;
    check_capacity(result, new_shape.numel(), "result")?;

    let from = input(src, result);
    let mut out = result.write();
    crate::dispatch_dtype!(result.dtype(), T => {
        let x = from.storage().typed::<T>()?;
        let o = out.typed_mut::<T>()?;
        o[..new_shape.numel()].fill(T::zero());
        for (i, &value) in x[..size].iter().enumerate() {
            let j = translation_index(i, new_shape.dims(), shape.dims());
            o[j] = o[j] + value;
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DataType;
    use crate::error::TensorError;

    fn buf32(data: &[f32]) -> Buffer {
        Buffer::from_vec(data.to_vec())
    }

    fn read32(buf: &Buffer) -> Vec<f32> {
        buf.read().to_vec::<f32>(buf.len())
    }

    #[test]
    fn test_binary_ops() {
        let a = buf32(&[1.0, 2.0, 3.0]);
        let b = buf32(&[4.0, 5.0, 6.0]);
        let out = Buffer::try_new(3, DataType::Float32).unwrap();

        binary(BinaryOp::Add, &a, &b, 3, &out).unwrap();
        assert_eq!(read32(&out), vec![5.0, 7.0, 9.0]);
        binary(BinaryOp::Div, &b, &a, 3, &out).unwrap();
        assert_eq!(read32(&out), vec![4.0, 2.5, 2.0]);
    }

    #[test]
    fn test_binary_in_place_alias() {
        let a = buf32(&[1.0, 2.0]);
        let b = buf32(&[10.0, 20.0]);
        binary(BinaryOp::Add, &a, &b, 2, &a).unwrap();
        assert_eq!(read32(&a), vec![11.0, 22.0]);

        // Both operands and the result are one buffer.
        binary(BinaryOp::Mul, &a, &a, 2, &a).unwrap();
        assert_eq!(read32(&a), vec![121.0, 484.0]);
    }

    #[test]
    fn test_scalar_variants_respect_operand_order() {
        let a = buf32(&[1.0, 2.0, 4.0]);
        let out = Buffer::try_new(3, DataType::Float32).unwrap();

        binary_scalar(BinaryOp::Sub, &a, 1.0, 3, &out).unwrap();
        assert_eq!(read32(&out), vec![0.0, 1.0, 3.0]);
        scalar_binary(BinaryOp::Sub, 1.0, &a, 3, &out).unwrap();
        assert_eq!(read32(&out), vec![0.0, -1.0, -3.0]);
        scalar_binary(BinaryOp::Div, 2.0, &a, 3, &out).unwrap();
        assert_eq!(read32(&out), vec![2.0, 1.0, 0.5]);
    }

    #[test]
    fn test_mixed_dtypes_rejected() {
        let a = buf32(&[1.0]);
        let b = Buffer::from_vec(vec![1.0f64]);
        let out = Buffer::try_new(1, DataType::Float32).unwrap();
        assert!(matches!(
            binary(BinaryOp::Add, &a, &b, 1, &out),
            Err(TensorError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_capacity_checked() {
        let a = buf32(&[1.0, 2.0]);
        let out = Buffer::try_new(1, DataType::Float32).unwrap();
        assert!(unary(UnaryOp::Neg, &a, 2, &out).is_err());
    }

    #[test]
    fn test_sum_and_mean() {
        let a = Buffer::from_vec(vec![1.0f64, 2.0, 3.0, 4.0]);
        let out = Buffer::try_new(1, DataType::Float64).unwrap();
        sum(&a, 4, &out).unwrap();
        assert_eq!(out.read().to_vec::<f64>(1), vec![10.0]);
        mean(&a, 4, &out).unwrap();
        assert_eq!(out.read().to_vec::<f64>(1), vec![2.5]);
    }

    #[test]
    fn test_matmul() {
        let a = buf32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = buf32(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let out = Buffer::try_new(4, DataType::Float32).unwrap();
        matmul(&a, &Shape::from([2, 3]), &b, &Shape::from([3, 2]), &out).unwrap();
        // [1,2,3] @ [[7,8],[9,10],[11,12]] = [58, 64]
        // [4,5,6] @ [[7,8],[9,10],[11,12]] = [139, 154]
        assert_eq!(read32(&out), vec![58.0, 64.0, 139.0, 154.0]);

        assert!(matmul(&a, &Shape::from([2, 3]), &b, &Shape::from([2, 3]), &out).is_err());
        assert!(matmul(&a, &Shape::from([6]), &b, &Shape::from([6]), &out).is_err());
    }

    #[test]
    fn test_transpose_2d() {
        let shape = Shape::from([2, 3]);
        let new_shape = Shape::from([3, 2]);
        let a = buf32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = Buffer::try_new(6, DataType::Float32).unwrap();
        transpose(
            0,
            1,
            &a,
            &shape,
            &shape.contiguous_strides(),
            &new_shape.contiguous_strides(),
            6,
            &out,
        )
        .unwrap();
        assert_eq!(read32(&out), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_transpose_outer_axes_of_3d() {
        // [2,1,3] -> swap(0,2) -> [3,1,2]
        let shape = Shape::from([2, 1, 3]);
        let new_shape = Shape::from([3, 1, 2]);
        let a = buf32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = Buffer::try_new(6, DataType::Float32).unwrap();
        transpose(
            0,
            2,
            &a,
            &shape,
            &shape.contiguous_strides(),
            &new_shape.contiguous_strides(),
            6,
            &out,
        )
        .unwrap();
        assert_eq!(read32(&out), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_converting_copy() {
        let src = Buffer::from_vec(vec![0.5f64, 1.25]);
        let dst = Buffer::try_new(2, DataType::Float32).unwrap();
        copy(&src, &dst, 2).unwrap();
        assert_eq!(read32(&dst), vec![0.5, 1.25]);
    }

    #[test]
    fn test_broadcast_and_reduce() {
        let small = Shape::from([1, 3]);
        let big = Shape::from([2, 3]);
        let src = buf32(&[1.0, 2.0, 3.0]);
        let wide = Buffer::try_new(6, DataType::Float32).unwrap();
        broadcast_to(&src, &small, &big, &wide).unwrap();
        assert_eq!(read32(&wide), vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);

        let back = buf32(&[9.0, 9.0, 9.0]);
        reduce_to(&wide, &big, &small, &back).unwrap();
        assert_eq!(read32(&back), vec![2.0, 4.0, 6.0]);

        assert!(broadcast_to(&src, &small, &Shape::from([2, 4]), &wide).is_err());
    }
}
