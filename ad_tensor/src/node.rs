//! Computation graph nodes and the user-facing [`Tensor`] handle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::device::Device;
use crate::dtype::{DataType, Element};
use crate::error::{Result, TensorError};
use crate::invalid_arg;
use crate::shape::Shape;
use crate::value::TensorValue;

/// Global counter for unique node IDs.
static NODE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_node_id() -> u64 {
    NODE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Unique identifier for a node in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u64);

/// The operation that produced a node. Determines its backward rule.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorOp {
    /// Created directly by the user.
    Leaf,

    // === Binary element-wise ===
    Add,
    Sub,
    Mul,
    Div,
    /// Gradient flows to the base only.
    Pow,

    // === Unary element-wise ===
    Neg,
    Sqrt,
    Sin,
    Cos,
    Tanh,
    Log,
    Exp,

    // === Reductions ===
    Sum,
    SumDim { dim: usize, keep_dim: bool },
    Mean,

    // === Linear algebra ===
    MatMul,

    // === Shape and type ===
    Transpose { dim0: usize, dim1: usize },
    Reshape { original_shape: Shape },
    BroadcastTo { original_shape: Shape },
    ToDType { original: DataType },
}

pub(crate) struct NodeState {
    pub(crate) value: TensorValue,
    /// Allocated on first accumulation or first read.
    pub(crate) grad: Option<TensorValue>,
    pub(crate) require_grad: bool,
    pub(crate) retain_grad: bool,
}

/// Internal node structure.
pub struct TensorNode {
    pub id: NodeId,
    pub op: TensorOp,
    pub parents: Vec<Tensor>,
    pub(crate) state: RwLock<NodeState>,
}

impl fmt::Debug for TensorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read_recursive();
        f.debug_struct("TensorNode")
            .field("id", &self.id)
            .field("op", &self.op)
            .field("shape", state.value.shape())
            .field("require_grad", &state.require_grad)
            .field("parents", &self.parents.len())
            .finish()
    }
}

/// A tensor in the computation graph.
///
/// Cloning is cheap and aliases the same node; gradients from every use of a
/// node are accumulated into it.
#[derive(Clone)]
pub struct Tensor(pub(crate) Arc<TensorNode>);

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.0.id)
            .field("op", &self.0.op)
            .field("shape", &self.shape())
            .finish()
    }
}

impl Tensor {
    fn new_node(op: TensorOp, value: TensorValue, parents: Vec<Tensor>) -> Self {
        let require_grad = parents.iter().any(Tensor::requires_grad);
        Tensor(Arc::new(TensorNode {
            id: NodeId(next_node_id()),
            op,
            parents,
            state: RwLock::new(NodeState {
                value,
                grad: None,
                require_grad,
                retain_grad: false,
            }),
        }))
    }

    // === Constructors ===

    /// Wrap a value as a leaf node.
    pub fn from_value(value: TensorValue, require_grad: bool) -> Self {
        Tensor(Arc::new(TensorNode {
            id: NodeId(next_node_id()),
            op: TensorOp::Leaf,
            parents: vec![],
            state: RwLock::new(NodeState {
                value,
                grad: None,
                require_grad,
                retain_grad: false,
            }),
        }))
    }

    /// A non-differentiable constant with this tensor's shape, type and device.
    pub fn constant_like(&self, value: f64) -> Result<Tensor> {
        let state = self.state();
        let constant = TensorValue::full(
            value,
            state.value.shape().clone(),
            state.value.dtype(),
            Arc::clone(state.value.device()),
        )?;
        Ok(Tensor::from_value(constant, false))
    }

    // === Accessors ===

    fn state(&self) -> RwLockReadGuard<'_, NodeState> {
        self.0.state.read_recursive()
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, NodeState> {
        self.0.state.write()
    }

    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn op(&self) -> &TensorOp {
        &self.0.op
    }

    pub fn parents(&self) -> &[Tensor] {
        &self.0.parents
    }

    pub fn is_leaf(&self) -> bool {
        self.0.parents.is_empty()
    }

    /// Read access to the forward value.
    pub fn value(&self) -> MappedRwLockReadGuard<'_, TensorValue> {
        RwLockReadGuard::map(self.state(), |s| &s.value)
    }

    /// Write access to the forward value, used by optimizers for in-place updates.
    pub fn value_mut(&self) -> MappedRwLockWriteGuard<'_, TensorValue> {
        RwLockWriteGuard::map(self.state_mut(), |s| &mut s.value)
    }

    pub fn shape(&self) -> Shape {
        self.state().value.shape().clone()
    }

    pub fn dtype(&self) -> DataType {
        self.state().value.dtype()
    }

    pub fn device(&self) -> Arc<dyn Device> {
        Arc::clone(self.state().value.device())
    }

    pub fn ndim(&self) -> usize {
        self.state().value.ndim()
    }

    pub fn numel(&self) -> usize {
        self.state().value.numel()
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.value().to_vec::<T>()
    }

    pub fn item<T: Element>(&self) -> Result<T> {
        self.value().item::<T>()
    }

    // === Gradient state ===

    pub fn requires_grad(&self) -> bool {
        self.state().require_grad
    }

    pub fn set_require_grad(&self, require_grad: bool) {
        self.state_mut().require_grad = require_grad;
    }

    pub fn is_retaining_grad(&self) -> bool {
        self.state().retain_grad
    }

    /// Keep this non-leaf tensor's gradient after a backward pass.
    pub fn retain_grad(&self) -> Result<()> {
        let mut state = self.state_mut();
        state.retain_grad = true;
        if let Some(grad) = state.grad.as_mut() {
            grad.fill(0.0)?;
        }
        Ok(())
    }

    /// Whether a backward pass should compute a gradient for this node.
    pub(crate) fn tracks_grad(&self) -> bool {
        let state = self.state();
        state.require_grad || state.retain_grad
    }

    /// Whether a backward pass stores the gradient on this node.
    pub(crate) fn keeps_grad(&self) -> bool {
        let state = self.state();
        state.retain_grad || (self.is_leaf() && state.require_grad)
    }

    /// Copy of the accumulated gradient. Zeros if nothing has been accumulated yet.
    pub fn grad(&self) -> Result<TensorValue> {
        if !self.keeps_grad() {
            return Err(TensorError::UngradedAccess);
        }
        let state = self.state();
        match &state.grad {
            Some(grad) => grad.try_clone(),
            None => TensorValue::zeros(
                state.value.shape().clone(),
                state.value.dtype(),
                Arc::clone(state.value.device()),
            ),
        }
    }

    pub fn zero_grad(&self) -> Result<()> {
        if let Some(grad) = self.state_mut().grad.as_mut() {
            grad.fill(0.0)?;
        }
        Ok(())
    }

    pub(crate) fn accumulate_grad(&self, seed: &TensorValue) -> Result<()> {
        let mut state = self.state_mut();
        if state.grad.is_none() {
            let zeros = TensorValue::zeros(
                state.value.shape().clone(),
                state.value.dtype(),
                Arc::clone(state.value.device()),
            )?;
            state.grad = Some(zeros);
        }
        match state.grad.as_mut() {
            Some(grad) => grad.add_assign(seed),
            None => Ok(()),
        }
    }

    /// Move the value and any gradient onto `device`.
    pub fn to(&self, device: Arc<dyn Device>) -> Result<()> {
        let mut state = self.state_mut();
        let value = state.value.to_device(Arc::clone(&device))?;
        let grad = match &state.grad {
            Some(grad) => Some(grad.to_device(device)?),
            None => None,
        };
        state.value = value;
        state.grad = grad;
        Ok(())
    }

    // === Backward ===

    /// Backward pass seeded with ones. See [`Tensor::backward_with`].
    pub fn backward(&self) -> Result<()> {
        self.backward_with(1.0)
    }

    /// Backward pass seeded with `value`.
    ///
    /// The seed is a scalar for scalar outputs and otherwise takes the shape of
    /// the first parent. Only tensors produced by an operation can start a pass.
    pub fn backward_with(&self, value: f64) -> Result<()> {
        let Some(first) = self.0.parents.first() else {
            return Err(invalid_arg!(
                "backward() requires a tensor produced by an operation"
            ));
        };
        let shape = if self.value().is_scalar() {
            Shape::scalar()
        } else {
            first.shape()
        };
        self.backward_with_shape(value, shape)
    }

    /// Backward pass seeded with `value` broadcast over `shape`, which must be
    /// this tensor's shape.
    pub fn backward_with_shape(&self, value: f64, shape: impl Into<Shape>) -> Result<()> {
        let shape = shape.into();
        let seed = {
            let own = self.value();
            if own.shape() != &shape {
                return Err(invalid_arg!(
                    "seed shape {} does not match tensor shape {}",
                    shape,
                    own.shape()
                ));
            }
            TensorValue::full(value, shape, own.dtype(), Arc::clone(own.device()))?
        };
        crate::backward::backward(self, seed)
    }

    // === Graph construction helpers ===

    fn unary_node(
        &self,
        op: TensorOp,
        f: impl FnOnce(&TensorValue) -> Result<TensorValue>,
    ) -> Result<Tensor> {
        let value = f(&*self.value())?;
        Ok(Tensor::new_node(op, value, vec![self.clone()]))
    }

    /// Promote and broadcast both operands through graph nodes so their
    /// adjoints cast and reduce gradients back automatically.
    fn binary_node(
        &self,
        other: &Tensor,
        op: TensorOp,
        f: impl FnOnce(&TensorValue, &TensorValue) -> Result<TensorValue>,
    ) -> Result<Tensor> {
        let dtype = self.dtype().promote(other.dtype());
        let (lhs_shape, rhs_shape) = (self.shape(), other.shape());
        let shape = if lhs_shape == rhs_shape {
            lhs_shape
        } else {
            lhs_shape.broadcast_with(&rhs_shape)?
        };

        let lhs = self.broadcast_to(shape.clone())?.to_dtype(dtype)?;
        let rhs = other.broadcast_to(shape)?.to_dtype(dtype)?;
        let value = f(&*lhs.value(), &*rhs.value())?;
        Ok(Tensor::new_node(op, value, vec![lhs, rhs]))
    }

    // === Binary operations ===

    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.binary_node(other, TensorOp::Add, |a, b| a.add(b))
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.binary_node(other, TensorOp::Sub, |a, b| a.sub(b))
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.binary_node(other, TensorOp::Mul, |a, b| a.mul(b))
    }

    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        self.binary_node(other, TensorOp::Div, |a, b| a.div(b))
    }

    /// Element-wise power. Only the base receives a gradient.
    pub fn pow(&self, exponent: &Tensor) -> Result<Tensor> {
        self.binary_node(exponent, TensorOp::Pow, |a, b| a.pow(b))
    }

    pub fn add_scalar(&self, scalar: f64) -> Result<Tensor> {
        self.add(&self.constant_like(scalar)?)
    }

    pub fn sub_scalar(&self, scalar: f64) -> Result<Tensor> {
        self.sub(&self.constant_like(scalar)?)
    }

    pub fn mul_scalar(&self, scalar: f64) -> Result<Tensor> {
        self.mul(&self.constant_like(scalar)?)
    }

    pub fn div_scalar(&self, scalar: f64) -> Result<Tensor> {
        self.div(&self.constant_like(scalar)?)
    }

    pub fn pow_scalar(&self, exponent: f64) -> Result<Tensor> {
        self.pow(&self.constant_like(exponent)?)
    }

    /// `scalar - self`
    pub fn rsub_scalar(&self, scalar: f64) -> Result<Tensor> {
        self.constant_like(scalar)?.sub(self)
    }

    /// `scalar / self`
    pub fn rdiv_scalar(&self, scalar: f64) -> Result<Tensor> {
        self.constant_like(scalar)?.div(self)
    }

    // === Unary operations ===

    pub fn neg(&self) -> Result<Tensor> {
        self.unary_node(TensorOp::Neg, TensorValue::neg)
    }

    pub fn sqrt(&self) -> Result<Tensor> {
        self.unary_node(TensorOp::Sqrt, TensorValue::sqrt)
    }

    pub fn sin(&self) -> Result<Tensor> {
        self.unary_node(TensorOp::Sin, TensorValue::sin)
    }

    pub fn cos(&self) -> Result<Tensor> {
        self.unary_node(TensorOp::Cos, TensorValue::cos)
    }

    pub fn tanh(&self) -> Result<Tensor> {
        self.unary_node(TensorOp::Tanh, TensorValue::tanh)
    }

    pub fn log(&self) -> Result<Tensor> {
        self.unary_node(TensorOp::Log, TensorValue::log)
    }

    pub fn exp(&self) -> Result<Tensor> {
        self.unary_node(TensorOp::Exp, TensorValue::exp)
    }

    // === Reductions ===

    /// Sum of all elements as a scalar.
    pub fn sum(&self) -> Result<Tensor> {
        self.unary_node(TensorOp::Sum, TensorValue::sum)
    }

    pub fn sum_dim(&self, dim: usize, keep_dim: bool) -> Result<Tensor> {
        self.unary_node(TensorOp::SumDim { dim, keep_dim }, |v| v.sum_dim(dim, keep_dim))
    }

    pub fn mean(&self) -> Result<Tensor> {
        self.unary_node(TensorOp::Mean, TensorValue::mean)
    }

    // === Linear algebra ===

    /// 2-D matrix product with element type promotion.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        let dtype = self.dtype().promote(other.dtype());
        let lhs = self.to_dtype(dtype)?;
        let rhs = other.to_dtype(dtype)?;
        let value = lhs.value().matmul(&rhs.value())?;
        Ok(Tensor::new_node(TensorOp::MatMul, value, vec![lhs, rhs]))
    }

    // === Shape and type ===

    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Tensor> {
        self.unary_node(TensorOp::Transpose { dim0, dim1 }, |v| v.transpose(dim0, dim1))
    }

    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        let original_shape = self.shape();
        self.unary_node(TensorOp::Reshape { original_shape }, |v| v.reshape(shape))
    }

    /// Remove the size-1 axis `dim`.
    pub fn squeeze(&self, dim: usize) -> Result<Tensor> {
        let shape = self.shape().squeezed(dim)?;
        self.reshape(shape)
    }

    /// Insert a size-1 axis at `dim`.
    pub fn unsqueeze(&self, dim: usize) -> Result<Tensor> {
        let shape = self.shape().unsqueezed(dim)?;
        self.reshape(shape)
    }

    /// Broadcast to `shape`. Returns this tensor when the shape already matches.
    pub fn broadcast_to(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        let original_shape = self.shape();
        if original_shape == shape {
            return Ok(self.clone());
        }
        self.unary_node(TensorOp::BroadcastTo { original_shape }, |v| v.broadcast_to(shape))
    }

    /// Cast to `dtype`. Returns this tensor when the type already matches.
    pub fn to_dtype(&self, dtype: DataType) -> Result<Tensor> {
        let original = self.dtype();
        if original == dtype {
            return Ok(self.clone());
        }
        self.unary_node(TensorOp::ToDType { original }, |v| v.to_dtype(dtype))
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.value(), f)
    }
}

// === Operator overloads ===
//
// Operators are fallible, so every overload yields `Result<Tensor>`. A
// `Result<Tensor>` is accepted on either side so expressions chain without
// intermediate `?`.

macro_rules! impl_binary_operator {
    ($trait:ident, $method:ident, $scalar:ident, $rscalar:ident) => {
        impl std::ops::$trait<&Tensor> for &Tensor {
            type Output = Result<Tensor>;
            fn $method(self, rhs: &Tensor) -> Result<Tensor> {
                Tensor::$method(self, rhs)
            }
        }

        impl std::ops::$trait<Tensor> for &Tensor {
            type Output = Result<Tensor>;
            fn $method(self, rhs: Tensor) -> Result<Tensor> {
                Tensor::$method(self, &rhs)
            }
        }

        impl std::ops::$trait<&Tensor> for Tensor {
            type Output = Result<Tensor>;
            fn $method(self, rhs: &Tensor) -> Result<Tensor> {
                Tensor::$method(&self, rhs)
            }
        }

        impl std::ops::$trait<Tensor> for Tensor {
            type Output = Result<Tensor>;
            fn $method(self, rhs: Tensor) -> Result<Tensor> {
                Tensor::$method(&self, &rhs)
            }
        }

        impl std::ops::$trait<Result<Tensor>> for &Tensor {
            type Output = Result<Tensor>;
            fn $method(self, rhs: Result<Tensor>) -> Result<Tensor> {
                Tensor::$method(self, &rhs?)
            }
        }

        impl std::ops::$trait<Result<Tensor>> for Tensor {
            type Output = Result<Tensor>;
            fn $method(self, rhs: Result<Tensor>) -> Result<Tensor> {
                Tensor::$method(&self, &rhs?)
            }
        }

        impl std::ops::$trait<&Tensor> for Result<Tensor> {
            type Output = Result<Tensor>;
            fn $method(self, rhs: &Tensor) -> Result<Tensor> {
                Tensor::$method(&self?, rhs)
            }
        }

        impl std::ops::$trait<Tensor> for Result<Tensor> {
            type Output = Result<Tensor>;
            fn $method(self, rhs: Tensor) -> Result<Tensor> {
                Tensor::$method(&self?, &rhs)
            }
        }

        impl std::ops::$trait<f64> for &Tensor {
            type Output = Result<Tensor>;
            fn $method(self, rhs: f64) -> Result<Tensor> {
                Tensor::$scalar(self, rhs)
            }
        }

        impl std::ops::$trait<f64> for Tensor {
            type Output = Result<Tensor>;
            fn $method(self, rhs: f64) -> Result<Tensor> {
                Tensor::$scalar(&self, rhs)
            }
        }

        impl std::ops::$trait<&Tensor> for f64 {
            type Output = Result<Tensor>;
            fn $method(self, rhs: &Tensor) -> Result<Tensor> {
                $rscalar(self, rhs)
            }
        }

        impl std::ops::$trait<Tensor> for f64 {
            type Output = Result<Tensor>;
            fn $method(self, rhs: Tensor) -> Result<Tensor> {
                $rscalar(self, &rhs)
            }
        }
    };
}

fn scalar_add(lhs: f64, rhs: &Tensor) -> Result<Tensor> {
    rhs.constant_like(lhs)?.add(rhs)
}

fn scalar_sub(lhs: f64, rhs: &Tensor) -> Result<Tensor> {
    rhs.rsub_scalar(lhs)
}

fn scalar_mul(lhs: f64, rhs: &Tensor) -> Result<Tensor> {
    rhs.constant_like(lhs)?.mul(rhs)
}

fn scalar_div(lhs: f64, rhs: &Tensor) -> Result<Tensor> {
    rhs.rdiv_scalar(lhs)
}

impl_binary_operator!(Add, add, add_scalar, scalar_add);
impl_binary_operator!(Sub, sub, sub_scalar, scalar_sub);
impl_binary_operator!(Mul, mul, mul_scalar, scalar_mul);
impl_binary_operator!(Div, div, div_scalar, scalar_div);

impl std::ops::Neg for &Tensor {
    type Output = Result<Tensor>;
    fn neg(self) -> Result<Tensor> {
        Tensor::neg(self)
    }
}

impl std::ops::Neg for Tensor {
    type Output = Result<Tensor>;
    fn neg(self) -> Result<Tensor> {
        Tensor::neg(&self)
    }
}
