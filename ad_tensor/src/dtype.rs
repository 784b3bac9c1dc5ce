//! Element types supported by the engine and their promotion rules.

use std::fmt;

use num_traits::Float;

use crate::buffer::Storage;
use crate::error::{Result, TensorError};
use crate::invalid_arg;

/// Element kind of a tensor buffer.
///
/// The discriminants index the promotion table, so their order is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(usize)]
pub enum DataType {
    Float64 = 0,
    #[default]
    Float32 = 1,
}

const PROMOTION_TABLE: [[DataType; DataType::COUNT]; DataType::COUNT] = [
    [DataType::Float64, DataType::Float64],
    [DataType::Float64, DataType::Float32],
];

impl DataType {
    /// Number of supported element kinds.
    pub const COUNT: usize = 2;

    /// Width of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::Float64 => 8,
            DataType::Float32 => 4,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Result type when combining two element kinds: the more precise one wins.
    pub fn promote(self, other: DataType) -> DataType {
        PROMOTION_TABLE[self.index()][other.index()]
    }

    /// Name used by the tensor printer.
    pub fn name(self) -> &'static str {
        match self {
            DataType::Float64 => "Double",
            DataType::Float32 => "Float",
        }
    }
}

impl TryFrom<usize> for DataType {
    type Error = TensorError;

    fn try_from(index: usize) -> Result<Self> {
        match index {
            0 => Ok(DataType::Float64),
            1 => Ok(DataType::Float32),
            _ => Err(invalid_arg!("data type index {} is not supported", index)),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A host element type that can live in a [`Storage`].
pub trait Element: Float + Default + fmt::Debug + fmt::Display + Send + Sync + 'static {
    const DTYPE: DataType;

    fn from_f64(v: f64) -> Self;
    fn as_f64(self) -> f64;

    fn slice(storage: &Storage) -> Option<&[Self]>;
    fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]>;
    fn into_storage(data: Vec<Self>) -> Storage;
}

impl Element for f64 {
    const DTYPE: DataType = DataType::Float64;

    fn from_f64(v: f64) -> Self {
        v
    }

    fn as_f64(self) -> f64 {
        self
    }

    fn slice(storage: &Storage) -> Option<&[Self]> {
        match storage {
            Storage::F64(v) => Some(v),
            _ => None,
        }
    }

    fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]> {
        match storage {
            Storage::F64(v) => Some(v),
            _ => None,
        }
    }

    fn into_storage(data: Vec<Self>) -> Storage {
        Storage::F64(data)
    }
}

impl Element for f32 {
    const DTYPE: DataType = DataType::Float32;

    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn as_f64(self) -> f64 {
        self as f64
    }

    fn slice(storage: &Storage) -> Option<&[Self]> {
        match storage {
            Storage::F32(v) => Some(v),
            _ => None,
        }
    }

    fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]> {
        match storage {
            Storage::F32(v) => Some(v),
            _ => None,
        }
    }

    fn into_storage(data: Vec<Self>) -> Storage {
        Storage::F32(data)
    }
}

/// Run `$body` with `$T` bound to the host type of `$dtype`.
#[macro_export]
macro_rules! dispatch_dtype {
    ($dtype:expr, $T:ident => $body:expr) => {
        match $dtype {
            $crate::dtype::DataType::Float64 => {
                type $T = f64;
                $body
            }
            $crate::dtype::DataType::Float32 => {
                type $T = f32;
                $body
            }
        }
    };
}
