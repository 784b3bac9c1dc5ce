//! Parameterised layers.

mod linear;

pub use linear::Linear;
