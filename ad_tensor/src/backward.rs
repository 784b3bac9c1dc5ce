//! Reverse-mode automatic differentiation over the tensor graph.
//!
//! Nodes are visited in reverse topological order, so each node's adjoint is
//! complete (summed over every downstream use) before it is propagated to the
//! node's parents.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::node::{NodeId, Tensor, TensorOp};
use crate::value::TensorValue;

/// Propagate `seed` from `root` back through every parent that tracks gradients.
pub(crate) fn backward(root: &Tensor, seed: TensorValue) -> Result<()> {
    let topo_order = topological_sort(root);

    let mut adjoints: HashMap<NodeId, TensorValue> = HashMap::new();
    adjoints.insert(root.id(), seed);

    for expr in topo_order.iter().rev() {
        let Some(adjoint) = adjoints.remove(&expr.id()) else {
            continue;
        };

        if expr.keeps_grad() {
            expr.accumulate_grad(&adjoint)?;
        }

        let parent_grads = compute_local_gradients(expr, &adjoint)?;
        for (parent, grad) in expr.parents().iter().zip(parent_grads) {
            let Some(grad) = grad else {
                continue;
            };
            match adjoints.entry(parent.id()) {
                Entry::Occupied(mut existing) => existing.get_mut().add_assign(&grad)?,
                Entry::Vacant(slot) => {
                    slot.insert(grad);
                }
            }
        }
    }

    Ok(())
}

fn when(needed: bool, f: impl FnOnce() -> Result<TensorValue>) -> Result<Option<TensorValue>> {
    if needed {
        f().map(Some)
    } else {
        Ok(None)
    }
}

/// Local gradient for each parent of `expr`, `None` for parents that do not
/// track gradients.
fn compute_local_gradients(expr: &Tensor, seed: &TensorValue) -> Result<Vec<Option<TensorValue>>> {
    let parents = expr.parents();
    let need = |i: usize| parents.get(i).is_some_and(Tensor::tracks_grad);

    let grads = match expr.op() {
        TensorOp::Leaf => vec![],

        // === Binary element-wise ===
        TensorOp::Add => vec![
            when(need(0), || seed.try_clone())?,
            when(need(1), || seed.try_clone())?,
        ],

        TensorOp::Sub => vec![
            when(need(0), || seed.try_clone())?,
            when(need(1), || seed.neg())?,
        ],

        TensorOp::Mul => {
            // d(a*b)/da = b, d(a*b)/db = a
            let (a, b) = (&parents[0], &parents[1]);
            vec![
                when(need(0), || seed.mul(&b.value()))?,
                when(need(1), || seed.mul(&a.value()))?,
            ]
        }

        TensorOp::Div => {
            // d(a/b)/da = 1/b, d(a/b)/db = -a/b^2
            let (a, b) = (&parents[0], &parents[1]);
            vec![
                when(need(0), || seed.div(&b.value()))?,
                when(need(1), || {
                    let b = b.value();
                    a.value().mul(seed)?.neg()?.div(&b.mul(&b)?)
                })?,
            ]
        }

        TensorOp::Pow => {
            // d(a^b)/da = b * a^(b-1); the exponent receives nothing
            let (a, b) = (&parents[0], &parents[1]);
            vec![
                when(need(0), || {
                    let b = b.value();
                    a.value().pow(&b.sub_scalar(1.0)?)?.mul(&b)?.mul(seed)
                })?,
                None,
            ]
        }

        // === Unary element-wise ===
        TensorOp::Neg => vec![when(need(0), || seed.neg())?],

        TensorOp::Sqrt => {
            // d(sqrt(x))/dx = 0.5 / sqrt(x)
            vec![when(need(0), || parents[0].value().sqrt()?.rdiv_scalar(0.5)?.mul(seed))?]
        }

        TensorOp::Sin => vec![when(need(0), || parents[0].value().cos()?.mul(seed))?],

        TensorOp::Cos => vec![when(need(0), || parents[0].value().sin()?.neg()?.mul(seed))?],

        TensorOp::Tanh => {
            // d(tanh(x))/dx = 1 - tanh(x)^2 = 1 - output^2
            vec![when(need(0), || {
                let out = expr.value();
                out.mul(&out)?.rsub_scalar(1.0)?.mul(seed)
            })?]
        }

        TensorOp::Log => vec![when(need(0), || seed.div(&parents[0].value()))?],

        TensorOp::Exp => {
            // d(exp(x))/dx = exp(x) = output
            vec![when(need(0), || seed.mul(&expr.value()))?]
        }

        // === Reductions ===
        TensorOp::Sum => vec![when(need(0), || seed.broadcast_to(parents[0].shape()))?],

        TensorOp::SumDim { dim, keep_dim } => vec![when(need(0), || {
            let input_shape = parents[0].shape();
            if *keep_dim {
                seed.broadcast_to(input_shape)
            } else {
                seed.reshape(seed.shape().unsqueezed(*dim)?)?
                    .broadcast_to(input_shape)
            }
        })?],

        TensorOp::Mean => vec![when(need(0), || {
            let input_shape = parents[0].shape();
            let count = input_shape.numel() as f64;
            seed.div_scalar(count)?.broadcast_to(input_shape)
        })?],

        // === Linear algebra ===
        TensorOp::MatMul => {
            // C = A @ B
            // dL/dA = dL/dC @ B^T
            // dL/dB = A^T @ dL/dC
            let (a, b) = (&parents[0], &parents[1]);
            vec![
                when(need(0), || seed.matmul(&b.value().transpose(0, 1)?))?,
                when(need(1), || a.value().transpose(0, 1)?.matmul(seed))?,
            ]
        }

        // === Shape and type ===
        TensorOp::Transpose { dim0, dim1 } => {
            vec![when(need(0), || seed.transpose(*dim0, *dim1))?]
        }

        TensorOp::Reshape { original_shape } => {
            vec![when(need(0), || seed.reshape(original_shape.clone()))?]
        }

        TensorOp::BroadcastTo { original_shape } => {
            vec![when(need(0), || seed.reduce_to(original_shape.clone()))?]
        }

        TensorOp::ToDType { original } => vec![when(need(0), || seed.to_dtype(*original))?],
    };

    Ok(grads)
}

/// Topological sort via DFS postorder. Iterative: graph depth is not bounded
/// by the call stack.
fn topological_sort(root: &Tensor) -> Vec<Tensor> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<(Tensor, bool)> = vec![(root.clone(), false)];

    while let Some((expr, expanded)) = stack.pop() {
        if expanded {
            order.push(expr);
            continue;
        }
        if !visited.insert(expr.id()) {
            continue;
        }
        stack.push((expr.clone(), true));
        for parent in expr.parents().iter().rev() {
            if !visited.contains(&parent.id()) {
                stack.push((parent.clone(), false));
            }
        }
    }

    order
}
