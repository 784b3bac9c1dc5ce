//! Shape and stride utilities for tensors.

use std::fmt;

use crate::error::Result;
use crate::invalid_arg;

/// A tensor shape (dimensions). An empty shape is a scalar.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    /// Create a new shape from dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// Create a scalar shape (0-dimensional).
    pub fn scalar() -> Self {
        Shape(vec![])
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Get dimension at index.
    pub fn dim(&self, idx: usize) -> usize {
        self.0[idx]
    }

    /// Get dimensions as slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Total number of elements. The empty product is 1.
    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// Check if this is a scalar (0-dim tensor).
    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// Compute row-major (C-contiguous) strides for this shape.
    pub fn contiguous_strides(&self) -> Strides {
        let ndim = self.0.len();
        if ndim == 0 {
            return Strides(vec![]);
        }

        let mut strides = vec![1usize; ndim];
        for i in (0..ndim - 1).rev() {
            strides[i] = strides[i + 1] * self.0[i + 1];
        }
        Strides(strides)
    }

    /// Broadcast two shapes against each other, aligning trailing dimensions.
    pub fn broadcast_with(&self, other: &Shape) -> Result<Shape> {
        let ndim = self.ndim().max(other.ndim());
        let mut result = vec![0usize; ndim];

        for i in 0..ndim {
            let d1 = if i < ndim - self.ndim() {
                1
            } else {
                self.0[i - (ndim - self.ndim())]
            };
            let d2 = if i < ndim - other.ndim() {
                1
            } else {
                other.0[i - (ndim - other.ndim())]
            };

            result[i] = if d1 == d2 || d2 == 1 {
                d1
            } else if d1 == 1 {
                d2
            } else {
                return Err(invalid_arg!(
                    "shapes {} and {} cannot be broadcast together",
                    self,
                    other
                ));
            };
        }

        Ok(Shape(result))
    }

    /// Check that this shape can be broadcast into `target`: every trailing
    /// dimension must match or be 1, and this shape may not have more dimensions.
    pub fn check_broadcast_to(&self, target: &Shape) -> Result<()> {
        if self.ndim() > target.ndim() {
            return Err(invalid_arg!(
                "cannot broadcast shape {} to lower rank shape {}",
                self,
                target
            ));
        }
        for (src, dst) in self.0.iter().rev().zip(target.0.iter().rev()) {
            if src != dst && *src != 1 {
                return Err(invalid_arg!("cannot broadcast shape {} to {}", self, target));
            }
        }
        Ok(())
    }

    /// Shape with the size-1 axis `dim` inserted.
    pub fn unsqueezed(&self, dim: usize) -> Result<Shape> {
        if dim > self.ndim() {
            return Err(invalid_arg!("unsqueeze dim {} out of range for shape {}", dim, self));
        }
        let mut dims = self.0.clone();
        dims.insert(dim, 1);
        Ok(Shape(dims))
    }

    /// Shape with the size-1 axis `dim` removed.
    pub fn squeezed(&self, dim: usize) -> Result<Shape> {
        if dim >= self.ndim() || self.0[dim] != 1 {
            return Err(invalid_arg!("cannot squeeze dim {} of shape {}", dim, self));
        }
        let mut dims = self.0.clone();
        dims.remove(dim);
        Ok(Shape(dims))
    }
}

/// Map a flat index into an array of `target` shape to the flat index of the
/// element it was broadcast from in an array of `source` shape.
///
/// Walks both shapes from the trailing dimension inward. Axes where the source
/// has size 1 (or no axis at all) consume a digit of `index` without moving the
/// source position.
pub fn translation_index(index: usize, source: &[usize], target: &[usize]) -> usize {
    let mut original = 0;
    let mut target_stride = 1;
    let mut source_stride = 1;
    let mut j = source.len();

    for &dim in target.iter().rev() {
        let dim_index = (index / target_stride) % dim;
        if j > 0 && source[j - 1] == dim {
            original += dim_index * source_stride;
            source_stride *= source[j - 1];
            j -= 1;
        } else if j > 0 && source[j - 1] == 1 {
            j -= 1;
        }
        target_stride *= dim;
    }

    original
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.0)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        if self.0.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(s: [usize; N]) -> Self {
        Shape(s.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}

/// Tensor strides (step size in each dimension).
#[derive(Clone, Default, PartialEq, Eq, Hash, Debug)]
pub struct Strides(pub Vec<usize>);

impl Strides {
    pub fn new(strides: Vec<usize>) -> Self {
        Strides(strides)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Compute flat index from multi-dimensional indices.
    pub fn index(&self, indices: &[usize]) -> usize {
        debug_assert_eq!(self.0.len(), indices.len());
        self.0.iter().zip(indices.iter()).map(|(s, i)| s * i).sum()
    }

    /// Split a flat index back into multi-dimensional indices.
    pub fn unflatten(&self, mut flat: usize) -> Vec<usize> {
        self.0
            .iter()
            .map(|&stride| {
                let idx = flat / stride;
                flat %= stride;
                idx
            })
            .collect()
    }
}
