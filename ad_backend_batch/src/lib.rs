//! Batched compute device for ad_tensor.
//!
//! [`BatchDevice`] follows the accelerator dispatch pattern: kernel calls are
//! encoded into command batches that a worker thread executes asynchronously,
//! and host reads synchronize first. Temporaries are recycled through a
//! size-keyed buffer cache once the batch that used them has completed.
//!
//! ```
//! use ad_backend_batch::create_device;
//! use ad_tensor::prelude::*;
//!
//! # fn main() -> ad_tensor::Result<()> {
//! let device = create_device(DeviceKind::Batched, 0)?;
//! let opts = TensorOptions::default().device(device.clone());
//! let x = tensor(&[1.0f32, 2.0, 3.0], [3], &opts)?;
//! let y = (&x * &x)?;
//! device.commit_and_wait()?;
//! assert_eq!(y.to_vec::<f32>()?, vec![1.0, 4.0, 9.0]);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ad_tensor::{cpu_device, invalid_arg, Device, DeviceKind, Result};
use log::info;

pub mod config;
pub mod device;
pub mod pool;
pub mod queue;

pub use config::BatchConfig;
pub use device::{BatchDevice, BatchStats};

/// Device handle for `kind`. The CPU device is a process-wide singleton with
/// index 0; every batched request gets a fresh device configured from the
/// environment.
pub fn create_device(kind: DeviceKind, index: usize) -> Result<Arc<dyn Device>> {
    match kind {
        DeviceKind::Cpu if index == 0 => Ok(cpu_device()),
        DeviceKind::Cpu => Err(invalid_arg!("CPU device index {} is out of range", index)),
        DeviceKind::Batched => {
            let device = BatchDevice::new(BatchConfig::from_env())?;
            info!("created batched device for index {}", index);
            Ok(Arc::new(device))
        }
    }
}
