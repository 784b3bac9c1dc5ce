//! Error type shared by the tensor engine and the crates built on it.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TensorError>;

#[derive(Debug, Error)]
pub enum TensorError {
    /// Incompatible shapes, bad dimension index, dtype mismatch or bad seed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(
        "Gradients for non-leaf tensors won't be populated during automatic gradient calculation. \
         Use retain_grad() on the non-leaf tensor if needed, or access the leaf tensor instead."
    )]
    UngradedAccess,

    /// Device memory could not be provided, even after reclaiming cached buffers.
    #[error("resource fault: {0}")]
    ResourceFault(String),

    #[error("Invalid parameter size found when loading the model: expected {expected}, found {found}.")]
    ParameterSize { expected: usize, found: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shorthand for returning an [`TensorError::InvalidArgument`].
#[macro_export]
macro_rules! invalid_arg {
    ($($arg:tt)*) => {
        $crate::error::TensorError::InvalidArgument(format!($($arg)*))
    };
}
