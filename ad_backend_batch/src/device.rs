//! The batching device.
//!
//! Kernel calls are encoded as commands into the current batch instead of
//! running on the caller's thread. A batch is committed to the worker when
//! it reaches `max_batch_size` commands, when allocation pressure passes half
//! the working set, or on an explicit [`Device::commit_and_wait`]. At most one
//! batch is in flight: committing waits for the previous one first.
//!
//! Buffers released through [`Device::deallocate`] and staging copies of
//! foreign operands are retired with the batch that is being encoded, and
//! only return to the cache from the worker's completion handler.

use std::collections::HashSet;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ad_tensor::device::{BinaryOp, Device, DeviceKind, UnaryOp};
use ad_tensor::kernels::{self, check_capacity, check_dtypes};
use ad_tensor::{Buffer, DataType, Result, Shape, Strides, TensorError};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::BatchConfig;
use crate::queue::{Batch, Command, Completion, Memory, Worker};

static DEVICE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Counters describing the device's batching and caching behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub committed_batches: u64,
    pub largest_batch: usize,
    pub pending_commands: usize,
    pub cache_bytes: usize,
    pub allocated_bytes: usize,
}

#[derive(Default)]
struct Encoder {
    commands: Vec<Command>,
    retired: Vec<Buffer>,
    /// Ids of buffers allocated here and not yet retired.
    owned: HashSet<u64>,
    working_set: usize,
    in_flight: Option<Completion>,
    next_batch: u64,
    committed_batches: u64,
    largest_batch: usize,
}

pub struct BatchDevice {
    config: BatchConfig,
    id: usize,
    encoder: Mutex<Encoder>,
    memory: Arc<Mutex<Memory>>,
    worker: Worker,
}

impl BatchDevice {
    pub fn new(config: BatchConfig) -> Result<Self> {
        let config = config.normalized();
        let id = DEVICE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let memory = Arc::new(Mutex::new(Memory::default()));
        let worker = Worker::spawn(format!("ad-batch-{}", id), Arc::clone(&memory))?;
        debug!("batch device {} created with {:?}", id, config);
        Ok(BatchDevice {
            config,
            id,
            encoder: Mutex::new(Encoder::default()),
            memory,
            worker,
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn stats(&self) -> BatchStats {
        let encoder = self.encoder.lock();
        let memory = self.memory.lock();
        BatchStats {
            committed_batches: encoder.committed_batches,
            largest_batch: encoder.largest_batch,
            pending_commands: encoder.commands.len(),
            cache_bytes: memory.pool.size(),
            allocated_bytes: memory.allocated,
        }
    }

    /// Drop every cached buffer.
    pub fn empty_cache(&self) {
        let freed = self.memory.lock().clear_cache();
        debug!("batch device {}: emptied cache, {} bytes released", self.id, freed);
    }

    /// True when `buffer` was allocated by this device and is still live.
    pub fn owns(&self, buffer: &Buffer) -> bool {
        self.encoder.lock().owned.contains(&buffer.id())
    }

    // === Batching ===

    fn encode(&self, encoder: &mut Encoder, name: &str, command: Command) -> Result<()> {
        encoder.commands.push(command);
        trace!(
            "batch device {}: encoded {} ({} pending)",
            self.id,
            name,
            encoder.commands.len()
        );
        if encoder.commands.len() >= self.config.max_batch_size {
            self.commit(encoder)?;
        }
        Ok(())
    }

    fn wait_in_flight(&self, encoder: &mut Encoder) -> Result<()> {
        match encoder.in_flight.take() {
            Some(completion) => completion.wait(),
            None => Ok(()),
        }
    }

    fn commit(&self, encoder: &mut Encoder) -> Result<()> {
        if encoder.commands.is_empty() && encoder.retired.is_empty() {
            return Ok(());
        }
        self.wait_in_flight(encoder)?;

        let commands = mem::take(&mut encoder.commands);
        let retired = mem::take(&mut encoder.retired);
        let count = commands.len();
        encoder.next_batch += 1;
        let batch = Batch {
            id: encoder.next_batch,
            commands,
            retired,
        };
        debug!("batch device {}: committing {:?}", self.id, batch);
        encoder.in_flight = Some(self.worker.submit(batch)?);

        encoder.committed_batches += 1;
        encoder.largest_batch = encoder.largest_batch.max(count);
        encoder.working_set = 0;

        let mut memory = self.memory.lock();
        if memory.pool.size() > self.config.max_working_set_bytes {
            let excess = memory.pool.size() - self.config.max_working_set_bytes;
            memory.trim_cache(excess);
        }
        Ok(())
    }

    fn synchronize(&self, encoder: &mut Encoder) -> Result<()> {
        self.commit(encoder)?;
        self.wait_in_flight(encoder)
    }

    // === Memory ===

    fn allocate_locked(&self, encoder: &mut Encoder, size: usize, dtype: DataType) -> Result<Buffer> {
        let bytes = size * dtype.size();
        encoder.working_set += bytes;
        if encoder.working_set * 2 >= self.config.max_working_set_bytes {
            self.commit(encoder)?;
        }

        let reused = self.memory.lock().pool.reuse(size, dtype);
        let buffer = match reused {
            Some(buffer) => buffer,
            None => self.allocate_fresh(encoder, size, dtype, bytes)?,
        };
        encoder.owned.insert(buffer.id());
        Ok(buffer)
    }

    fn allocate_fresh(
        &self,
        encoder: &mut Encoder,
        size: usize,
        dtype: DataType,
        bytes: usize,
    ) -> Result<Buffer> {
        if !self.fits(bytes) {
            let freed = self.memory.lock().clear_cache();
            warn!(
                "Buffer cache was cleared to create memory ({} bytes). \
                 Consider increasing memory size to improve performance.",
                freed
            );
            if !self.fits(bytes) {
                // Retirements of the pending batch may free enough.
                self.synchronize(encoder)?;
                self.memory.lock().clear_cache();
            }
            if !self.fits(bytes) {
                return Err(TensorError::ResourceFault(format!(
                    "device memory allocation has failed for size: {} bytes",
                    bytes
                )));
            }
        }

        let buffer = match Buffer::try_new(size, dtype) {
            Ok(buffer) => buffer,
            Err(_) => {
                self.memory.lock().clear_cache();
                warn!("allocation failed, retrying after clearing the buffer cache");
                Buffer::try_new(size, dtype)?
            }
        };
        self.memory.lock().allocated += bytes;
        Ok(buffer)
    }

    fn fits(&self, bytes: usize) -> bool {
        self.memory
            .lock()
            .allocated
            .checked_add(bytes)
            .map_or(false, |total| total <= self.config.memory_limit_bytes)
    }

    /// Operand handle usable by an encoded command. Buffers this device did
    /// not allocate are copied into a temporary retired with the batch.
    fn stage(&self, encoder: &mut Encoder, buffer: &Buffer) -> Result<Buffer> {
        if encoder.owned.contains(&buffer.id()) {
            return Ok(buffer.clone());
        }
        let temp = self.allocate_locked(encoder, buffer.len(), buffer.dtype())?;
        *temp.write() = buffer.read().clone();
        encoder.owned.remove(&temp.id());
        encoder.retired.push(temp.clone());
        trace!(
            "batch device {}: staged foreign buffer {} into {}",
            self.id,
            buffer.id(),
            temp.id()
        );
        Ok(temp)
    }

    /// Encode `kernel` over staged `inputs`. A result buffer this device does
    /// not own is written synchronously instead, so the caller sees the write.
    fn dispatch<const N: usize>(
        &self,
        name: &'static str,
        inputs: [&Buffer; N],
        result: &Buffer,
        kernel: impl FnOnce([&Buffer; N], &Buffer) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let mut encoder = self.encoder.lock();
        if !encoder.owned.contains(&result.id()) {
            drop(encoder);
            return self.fallback(|| kernel(inputs, result));
        }

        let mut staged = Vec::with_capacity(N);
        for input in inputs {
            staged.push(self.stage(&mut encoder, input)?);
        }
        let result = result.clone();
        let command: Command = Box::new(move || {
            let inputs: [&Buffer; N] = std::array::from_fn(|i| &staged[i]);
            kernel(inputs, &result)
        });
        self.encode(&mut encoder, name, command)
    }

    /// Run a reference kernel on the caller's thread after all queued work.
    fn fallback(&self, kernel: impl FnOnce() -> Result<()>) -> Result<()> {
        self.commit_and_wait()?;
        kernel()
    }
}

impl Device for BatchDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Batched
    }

    fn allocate(&self, size: usize, dtype: DataType) -> Result<Buffer> {
        let mut encoder = self.encoder.lock();
        self.allocate_locked(&mut encoder, size, dtype)
    }

    fn deallocate(&self, buffer: Buffer) {
        let mut encoder = self.encoder.lock();
        if encoder.owned.remove(&buffer.id()) {
            encoder.retired.push(buffer);
        }
    }

    fn binary(&self, op: BinaryOp, a: &Buffer, b: &Buffer, size: usize, result: &Buffer) -> Result<()> {
        check_dtypes(&[a, b], result)?;
        check_capacity(a, size, "lhs")?;
        check_capacity(b, size, "rhs")?;
        check_capacity(result, size, "result")?;
        self.dispatch("binary", [a, b], result, move |[a, b], result| {
            kernels::binary(op, a, b, size, result)
        })
    }

    fn binary_scalar(
        &self,
        op: BinaryOp,
        a: &Buffer,
        scalar: f64,
        size: usize,
        result: &Buffer,
    ) -> Result<()> {
        check_dtypes(&[a], result)?;
        check_capacity(a, size, "input")?;
        check_capacity(result, size, "result")?;
        self.dispatch("binary_scalar", [a], result, move |[a], result| {
            kernels::binary_scalar(op, a, scalar, size, result)
        })
    }

    fn scalar_binary(
        &self,
        op: BinaryOp,
        scalar: f64,
        a: &Buffer,
        size: usize,
        result: &Buffer,
    ) -> Result<()> {
        check_dtypes(&[a], result)?;
        check_capacity(a, size, "input")?;
        check_capacity(result, size, "result")?;
        self.dispatch("scalar_binary", [a], result, move |[a], result| {
            kernels::scalar_binary(op, scalar, a, size, result)
        })
    }

    fn unary(&self, op: UnaryOp, a: &Buffer, size: usize, result: &Buffer) -> Result<()> {
        check_dtypes(&[a], result)?;
        check_capacity(a, size, "input")?;
        check_capacity(result, size, "result")?;
        self.dispatch("unary", [a], result, move |[a], result| {
            kernels::unary(op, a, size, result)
        })
    }

    fn fill(&self, scalar: f64, size: usize, result: &Buffer) -> Result<()> {
        check_capacity(result, size, "result")?;
        self.dispatch("fill", [], result, move |[], result| {
            kernels::fill(scalar, size, result)
        })
    }

    fn sum(&self, a: &Buffer, size: usize, result: &Buffer) -> Result<()> {
        self.fallback(|| kernels::sum(a, size, result))
    }

    fn mean(&self, a: &Buffer, size: usize, result: &Buffer) -> Result<()> {
        self.fallback(|| kernels::mean(a, size, result))
    }

    fn matmul(
        &self,
        a: &Buffer,
        shape_a: &Shape,
        b: &Buffer,
        shape_b: &Shape,
        result: &Buffer,
    ) -> Result<()> {
        if shape_a.ndim() != 2 || shape_b.ndim() != 2 || shape_a.dim(1) != shape_b.dim(0) {
            return Err(ad_tensor::invalid_arg!(
                "matmul shapes are not compatible: {} and {}",
                shape_a,
                shape_b
            ));
        }
        check_dtypes(&[a, b], result)?;
        check_capacity(a, shape_a.numel(), "lhs")?;
        check_capacity(b, shape_b.numel(), "rhs")?;
        check_capacity(result, shape_a.dim(0) * shape_b.dim(1), "result")?;

        let (shape_a, shape_b) = (shape_a.clone(), shape_b.clone());
        self.dispatch("matmul", [a, b], result, move |[a, b], result| {
            kernels::matmul(a, &shape_a, b, &shape_b, result)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn transpose(
        &self,
        dim0: usize,
        dim1: usize,
        data: &Buffer,
        shape: &Shape,
        old_strides: &Strides,
        new_strides: &Strides,
        size: usize,
        result: &Buffer,
    ) -> Result<()> {
        self.fallback(|| {
            kernels::transpose(dim0, dim1, data, shape, old_strides, new_strides, size, result)
        })
    }

    fn copy(&self, src: &Buffer, dst: &Buffer, size: usize) -> Result<()> {
        check_capacity(src, size, "source")?;
        check_capacity(dst, size, "destination")?;

        self.dispatch("copy", [src], dst, move |[src], dst| kernels::copy(src, dst, size))
    }

    fn broadcast_to(&self, src: &Buffer, shape: &Shape, new_shape: &Shape, result: &Buffer) -> Result<()> {
        self.fallback(|| kernels::broadcast_to(src, shape, new_shape, result))
    }

    fn reduce_to(&self, src: &Buffer, shape: &Shape, new_shape: &Shape, result: &Buffer) -> Result<()> {
        self.fallback(|| kernels::reduce_to(src, shape, new_shape, result))
    }

    fn commit_and_wait(&self) -> Result<()> {
        let mut encoder = self.encoder.lock();
        self.synchronize(&mut encoder)
    }
}

impl fmt::Debug for BatchDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchDevice")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for BatchDevice {
    fn drop(&mut self) {
        let encoder = self.encoder.get_mut();
        if !encoder.commands.is_empty() {
            warn!("Queued tensor operations detected. Did you forget to call synchronize()?");
        }
        if let Some(completion) = encoder.in_flight.take() {
            let _ = completion.wait();
        }
        self.memory.lock().clear_cache();
        self.worker.shutdown();
    }
}
