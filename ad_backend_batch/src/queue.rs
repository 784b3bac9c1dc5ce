//! Command batches and the worker thread that executes them.

use std::fmt;
use std::sync::Arc;
use std::thread;

use ad_tensor::{Buffer, Result, TensorError};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error};
use parking_lot::Mutex;

use crate::pool::BufferPool;

/// One encoded kernel invocation. Captured buffer handles keep the operands
/// alive until the command has run.
pub type Command = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Cache and allocation accounting shared with completion handlers.
#[derive(Debug, Default)]
pub struct Memory {
    pub pool: BufferPool,
    /// Bytes in buffers this device allocated and still tracks, cached or live.
    pub allocated: usize,
}

impl Memory {
    /// Return a retired buffer to the cache, or forget it when another
    /// handle still refers to the allocation.
    pub fn retire(&mut self, buffer: Buffer) {
        if buffer.handle_count() == 1 {
            self.pool.recycle(buffer);
        } else {
            self.allocated = self.allocated.saturating_sub(buffer.byte_size());
        }
    }

    pub fn clear_cache(&mut self) -> usize {
        let freed = self.pool.clear();
        self.allocated = self.allocated.saturating_sub(freed);
        freed
    }

    pub fn trim_cache(&mut self, bytes: usize) -> usize {
        let freed = self.pool.reduce_size(bytes);
        self.allocated = self.allocated.saturating_sub(freed);
        freed
    }
}

/// Commands committed together, plus the buffers to retire once they ran.
pub struct Batch {
    pub id: u64,
    pub commands: Vec<Command>,
    pub retired: Vec<Buffer>,
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("commands", &self.commands.len())
            .field("retired", &self.retired.len())
            .finish()
    }
}

enum Message {
    Run(Batch, Sender<Result<()>>),
    Shutdown,
}

/// Handle to a submitted batch; resolves once its completion handler ran.
#[derive(Debug)]
pub struct Completion {
    id: u64,
    receiver: Receiver<Result<()>>,
}

impl Completion {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the batch has executed and its temporaries were retired.
    pub fn wait(self) -> Result<()> {
        self.receiver.recv().map_err(|_| {
            TensorError::ResourceFault(format!("batch {} was dropped by the worker", self.id))
        })?
    }
}

/// Single worker thread executing batches in submission order.
pub struct Worker {
    sender: Sender<Message>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Worker {
    pub fn spawn(name: String, memory: Arc<Mutex<Memory>>) -> Result<Self> {
        let (sender, receiver) = unbounded::<Message>();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(receiver, memory))
            .map_err(|err| TensorError::ResourceFault(format!("failed to spawn batch worker: {}", err)))?;
        Ok(Worker {
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn submit(&self, batch: Batch) -> Result<Completion> {
        let id = batch.id;
        let (done, receiver) = bounded(1);
        self.sender
            .send(Message::Run(batch, done))
            .map_err(|_| TensorError::ResourceFault("batch worker has exited".into()))?;
        Ok(Completion { id, receiver })
    }

    /// Stop after already submitted batches and join the thread.
    pub fn shutdown(&self) {
        let _ = self.sender.send(Message::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("batch worker panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<Message>, memory: Arc<Mutex<Memory>>) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Run(batch, done) => {
                let id = batch.id;
                if done.send(execute(batch, &memory)).is_err() {
                    debug!("batch {}: completion handle dropped before the result", id);
                }
            }
            Message::Shutdown => break,
        }
    }
}

/// Run every command, then hand the batch's temporaries back to the cache.
/// The first failure is reported; later commands still run.
fn execute(batch: Batch, memory: &Mutex<Memory>) -> Result<()> {
    let Batch {
        id,
        commands,
        retired,
    } = batch;
    let count = commands.len();

    let mut outcome = Ok(());
    for command in commands {
        if let Err(err) = command() {
            error!("batch {}: command failed: {}", id, err);
            if outcome.is_ok() {
                outcome = Err(err);
            }
        }
    }

    let mut memory = memory.lock();
    let retired_count = retired.len();
    for buffer in retired {
        memory.retire(buffer);
    }
    debug!(
        "batch {} completed: {} commands, {} buffers retired",
        id, count, retired_count
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use ad_tensor::DataType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_batches_run_in_order_and_retire() {
        let memory = Arc::new(Mutex::new(Memory::default()));
        let worker = Worker::spawn("test-batch".into(), Arc::clone(&memory)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let commands = (0..3)
            .map(|i| {
                let counter = Arc::clone(&counter);
                Box::new(move || {
                    assert_eq!(counter.fetch_add(1, Ordering::SeqCst), i);
                    Ok(())
                }) as Command
            })
            .collect();
        let retired = vec![Buffer::try_new(4, DataType::Float32).unwrap()];
        worker
            .submit(Batch {
                id: 1,
                commands,
                retired,
            })
            .unwrap()
            .wait()
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(memory.lock().pool.len(), 1);
    }

    #[test]
    fn test_failed_command_is_reported() {
        let memory = Arc::new(Mutex::new(Memory::default()));
        let worker = Worker::spawn("test-batch".into(), memory).unwrap();
        let failing: Command = Box::new(|| Err(TensorError::InvalidArgument("boom".into())));
        let result = worker
            .submit(Batch {
                id: 7,
                commands: vec![failing],
                retired: Vec::new(),
            })
            .unwrap()
            .wait();
        assert!(matches!(result, Err(TensorError::InvalidArgument(_))));
    }

    #[test]
    fn test_worker_survives_dropped_completion() {
        let memory = Arc::new(Mutex::new(Memory::default()));
        let worker = Worker::spawn("test-batch".into(), memory).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        let first: Command = Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        drop(
            worker
                .submit(Batch {
                    id: 1,
                    commands: vec![first],
                    retired: Vec::new(),
                })
                .unwrap(),
        );

        worker
            .submit(Batch {
                id: 2,
                commands: Vec::new(),
                retired: Vec::new(),
            })
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_buffer_is_not_cached() {
        let mut memory = Memory::default();
        let buffer = Buffer::try_new(4, DataType::Float32).unwrap();
        memory.allocated = buffer.byte_size();
        let _held = buffer.clone();
        memory.retire(buffer);
        assert!(memory.pool.is_empty());
        assert_eq!(memory.allocated, 0);
    }
}
