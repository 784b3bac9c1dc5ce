//! Size-keyed cache of retired device buffers.

use std::collections::{BTreeMap, VecDeque};

use ad_tensor::{Buffer, DataType};
use log::debug;

/// Buffers are keyed by capacity and element type; reuse requires an exact
/// match so a recycled buffer never changes a value's reported length.
#[derive(Debug, Default)]
pub struct BufferPool {
    buckets: BTreeMap<(usize, usize), VecDeque<Buffer>>,
    bytes: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held by cached buffers.
    pub fn size(&self) -> usize {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn reuse(&mut self, len: usize, dtype: DataType) -> Option<Buffer> {
        let key = (len, dtype.index());
        let bucket = self.buckets.get_mut(&key)?;
        let buffer = bucket.pop_front()?;
        if bucket.is_empty() {
            self.buckets.remove(&key);
        }
        self.bytes -= buffer.byte_size();
        Some(buffer)
    }

    pub fn recycle(&mut self, buffer: Buffer) {
        self.bytes += buffer.byte_size();
        self.buckets
            .entry((buffer.len(), buffer.dtype().index()))
            .or_default()
            .push_back(buffer);
    }

    /// Drop cached buffers, largest first, until at least `bytes` are freed.
    /// Returns the bytes released.
    pub fn reduce_size(&mut self, bytes: usize) -> usize {
        let mut freed = 0;
        while freed < bytes {
            let Some(mut entry) = self.buckets.last_entry() else {
                break;
            };
            if let Some(buffer) = entry.get_mut().pop_back() {
                freed += buffer.byte_size();
            }
            if entry.get().is_empty() {
                entry.remove();
            }
        }
        self.bytes -= freed;
        debug!("buffer cache trimmed by {} bytes, {} remain", freed, self.bytes);
        freed
    }

    /// Drop every cached buffer. Returns the bytes released.
    pub fn clear(&mut self) -> usize {
        let freed = self.bytes;
        self.buckets.clear();
        self.bytes = 0;
        freed
    }
}
