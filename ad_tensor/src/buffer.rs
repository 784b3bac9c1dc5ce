//! Device buffers: fixed-length, typed element storage behind a shared handle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::dtype::{DataType, Element};
use crate::error::{Result, TensorError};

static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Typed element storage.
#[derive(Clone, Debug, PartialEq)]
pub enum Storage {
    F64(Vec<f64>),
    F32(Vec<f32>),
}

impl Storage {
    /// Zero-filled storage. Allocation failure is reported instead of aborting.
    pub fn try_zeroed(size: usize, dtype: DataType) -> Result<Storage> {
        fn zeroed<T: Element>(size: usize) -> Result<Vec<T>> {
            let mut data = Vec::new();
            data.try_reserve_exact(size).map_err(|err| {
                warn!("allocation of {} {} elements failed", size, T::DTYPE);
                TensorError::ResourceFault(format!(
                    "allocation of {} {} elements failed: {}",
                    size,
                    T::DTYPE,
                    err
                ))
            })?;
            data.resize(size, T::zero());
            Ok(data)
        }

        Ok(crate::dispatch_dtype!(dtype, T => T::into_storage(zeroed::<T>(size)?)))
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Storage::F64(_) => DataType::Float64,
            Storage::F32(_) => DataType::Float32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Storage::F64(v) => v.len(),
            Storage::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Typed view of the elements, failing if `T` is not the stored type.
    pub fn typed<T: Element>(&self) -> Result<&[T]> {
        T::slice(self).ok_or_else(|| {
            crate::invalid_arg!("expected a {} buffer, found {}", T::DTYPE, self.dtype())
        })
    }

    pub fn typed_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        let found = self.dtype();
        T::slice_mut(self)
            .ok_or_else(|| crate::invalid_arg!("expected a {} buffer, found {}", T::DTYPE, found))
    }

    /// First `len` elements converted to `T`.
    pub fn to_vec<T: Element>(&self, len: usize) -> Vec<T> {
        match self {
            Storage::F64(v) => v.iter().take(len).map(|&x| T::from_f64(x)).collect(),
            Storage::F32(v) => v.iter().take(len).map(|&x| T::from_f64(x as f64)).collect(),
        }
    }

    /// Raw native-endian bytes of the first `len` elements.
    pub fn to_ne_bytes(&self, len: usize) -> Vec<u8> {
        match self {
            Storage::F64(v) => v.iter().take(len).flat_map(|x| x.to_ne_bytes()).collect(),
            Storage::F32(v) => v.iter().take(len).flat_map(|x| x.to_ne_bytes()).collect(),
        }
    }

    /// Overwrite the leading elements from native-endian bytes of this storage's type.
    pub fn copy_from_ne_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let width = self.dtype().size();
        if bytes.len() % width != 0 || bytes.len() / width > self.len() {
            return Err(crate::invalid_arg!(
                "{} bytes do not fit a {} buffer of {} elements",
                bytes.len(),
                self.dtype(),
                self.len()
            ));
        }
        match self {
            Storage::F64(v) => {
                for (dst, chunk) in v.iter_mut().zip(bytes.chunks_exact(8)) {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(chunk);
                    *dst = f64::from_ne_bytes(raw);
                }
            }
            Storage::F32(v) => {
                for (dst, chunk) in v.iter_mut().zip(bytes.chunks_exact(4)) {
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(chunk);
                    *dst = f32::from_ne_bytes(raw);
                }
            }
        }
        Ok(())
    }
}

struct BufferInner {
    id: u64,
    dtype: DataType,
    len: usize,
    storage: RwLock<Storage>,
}

/// Shared handle to a device allocation.
///
/// Cloning the handle does not copy the elements; a [`crate::TensorValue`]
/// owns exactly one handle and deep copies go through the device.
#[derive(Clone)]
pub struct Buffer(Arc<BufferInner>);

impl Buffer {
    /// Allocate a zero-filled buffer on the host heap.
    pub fn try_new(len: usize, dtype: DataType) -> Result<Buffer> {
        Ok(Buffer::from_storage(Storage::try_zeroed(len, dtype)?))
    }

    pub fn from_storage(storage: Storage) -> Buffer {
        Buffer(Arc::new(BufferInner {
            id: BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            dtype: storage.dtype(),
            len: storage.len(),
            storage: RwLock::new(storage),
        }))
    }

    pub fn from_vec<T: Element>(data: Vec<T>) -> Buffer {
        Buffer::from_storage(T::into_storage(data))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn dtype(&self) -> DataType {
        self.0.dtype
    }

    /// Capacity in elements.
    pub fn len(&self) -> usize {
        self.0.len
    }

    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    pub fn byte_size(&self) -> usize {
        self.0.len * self.0.dtype.size()
    }

    /// True when both handles refer to the same allocation.
    pub fn same(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of live handles to this allocation.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Storage> {
        self.0.storage.read_recursive()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Storage> {
        self.0.storage.write()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.0.id)
            .field("dtype", &self.0.dtype)
            .field("len", &self.0.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_buffer() {
        let buf = Buffer::try_new(4, DataType::Float64).unwrap();
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.byte_size(), 32);
        assert_eq!(buf.read().to_vec::<f64>(4), vec![0.0; 4]);
    }

    #[test]
    fn test_oversized_allocation_is_resource_fault() {
        assert!(matches!(
            Storage::try_zeroed(usize::MAX, DataType::Float64),
            Err(TensorError::ResourceFault(_))
        ));
    }

    #[test]
    fn test_typed_view_checks_dtype() {
        let buf = Buffer::from_vec(vec![1.0f32, 2.0]);
        assert!(buf.read().typed::<f32>().is_ok());
        assert!(matches!(
            buf.read().typed::<f64>(),
            Err(TensorError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_native_byte_round_trip() {
        let src = Buffer::from_vec(vec![1.5f32, -2.25, 3.0]);
        let bytes = src.read().to_ne_bytes(3);
        assert_eq!(bytes.len(), 12);

        let dst = Buffer::try_new(3, DataType::Float32).unwrap();
        dst.write().copy_from_ne_bytes(&bytes).unwrap();
        assert_eq!(dst.read().to_vec::<f32>(3), vec![1.5, -2.25, 3.0]);
        assert!(dst.write().copy_from_ne_bytes(&bytes[..5]).is_err());
    }

    #[test]
    fn test_handles_share_allocation() {
        let a = Buffer::try_new(2, DataType::Float32).unwrap();
        let b = a.clone();
        assert!(a.same(&b));
        assert_eq!(a.handle_count(), 2);
        assert!(!a.same(&Buffer::try_new(2, DataType::Float32).unwrap()));
    }
}
