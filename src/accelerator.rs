//! Batched execution on a compute device other than the calling thread.
//!
//! A device is never reached through global state. The caller acquires an
//! [`AcceleratorContext`] around a [`ComputeDevice`], hands a reference to it to each
//! analysis, and releases it when done. The context holds no per-region state, so one
//! context may serve any number of unrelated trace sets.
//!
//! Every failure a device reports is a [`DeviceError`], and none of them is fatal to an
//! analysis: the normalizer retries the batch on the host path instead.
use std::fmt::Debug;

use log::{debug, warn};
use ndarray::{Array2, ArrayView1, ArrayView2};
use thiserror::Error;

/// All the ways a compute device can fail
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("The compute device is not available")]
    Unavailable,
    #[error("The compute device cannot hold {requested} bytes, {available} bytes are available")]
    OutOfMemory { requested: u64, available: u64 },
    #[error("The compute device failed: {0}")]
    Failure(String),
}

/// What the execution planner needs to know about a device
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub available: bool,
    pub memory_bytes: u64,
}

impl DeviceStatus {
    pub fn unavailable() -> Self {
        Self::default()
    }
}

/// A per-region transform applied independently to each column of a batch
pub trait ColumnKernel: Sync {
    /// Transform one region's samples, returning exactly one value per frame
    fn apply(&self, column: ArrayView1<'_, f32>) -> Vec<f32>;
}

/// A device that can run a [`ColumnKernel`] over a frames × regions batch
pub trait ComputeDevice: Debug + Send + Sync {
    fn name(&self) -> &str;

    /// The memory the device can dedicate to one batch, in bytes
    fn memory_bytes(&self) -> u64;

    /// Whether the device is ready to [`execute`](ComputeDevice::execute)
    fn is_ready(&self) -> bool {
        true
    }

    /// Prepare the device for use. Called once by [`AcceleratorContext::acquire`].
    fn initialize(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Tear the device down. Called once when the owning context is released.
    fn release(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Transfer `batch` to the device, apply `kernel` to every column and transfer the
    /// result back. This blocks until the result is available.
    fn execute(
        &self,
        batch: ArrayView2<'_, f32>,
        kernel: &dyn ColumnKernel,
    ) -> Result<Array2<f32>, DeviceError>;
}

/// An acquired compute device, shared by reference across analyses
#[derive(Debug)]
pub struct AcceleratorContext {
    device: Option<Box<dyn ComputeDevice>>,
}

impl AcceleratorContext {
    /// Initialize `device` and take ownership of it
    pub fn acquire<D: ComputeDevice + 'static>(mut device: D) -> Result<Self, DeviceError> {
        device.initialize()?;
        debug!(
            "Acquired compute device {} with {} bytes",
            device.name(),
            device.memory_bytes()
        );
        Ok(Self {
            device: Some(Box::new(device)),
        })
    }

    pub fn device(&self) -> Option<&dyn ComputeDevice> {
        self.device.as_deref()
    }

    pub fn status(&self) -> DeviceStatus {
        match self.device() {
            Some(device) if device.is_ready() => DeviceStatus {
                available: true,
                memory_bytes: device.memory_bytes(),
            },
            _ => DeviceStatus::unavailable(),
        }
    }

    /// Release the device, reporting any failure to tear it down
    pub fn release(mut self) -> Result<(), DeviceError> {
        match self.device.take() {
            Some(mut device) => {
                debug!("Releasing compute device {}", device.name());
                device.release()
            }
            None => Ok(()),
        }
    }
}

impl Drop for AcceleratorContext {
    fn drop(&mut self) {
        if let Some(mut device) = self.device.take() {
            if let Err(err) = device.release() {
                warn!("Failed to release compute device {}: {err}", device.name());
            }
        }
    }
}

/// Check that a batch of `elements` samples fits in `memory_bytes`
pub fn check_capacity(elements: usize, memory_bytes: u64) -> Result<(), DeviceError> {
    let requested = (elements * std::mem::size_of::<f32>()) as u64;
    if requested > memory_bytes {
        Err(DeviceError::OutOfMemory {
            requested,
            available: memory_bytes,
        })
    } else {
        Ok(())
    }
}

#[cfg(feature = "parallelism")]
mod thread_pool {
    use super::*;
    use crate::parallel::map_columns;

    /// A [`ComputeDevice`] backed by a dedicated rayon thread pool.
    ///
    /// Batches run on the pool's workers rather than the global pool, with a declared
    /// memory budget that the execution planner chunks against.
    #[derive(Debug)]
    pub struct ThreadPoolDevice {
        threads: usize,
        memory_bytes: u64,
        pool: Option<rayon::ThreadPool>,
    }

    impl ThreadPoolDevice {
        /// A device with `threads` workers, zero meaning one per logical core
        pub fn new(threads: usize, memory_bytes: u64) -> Self {
            Self {
                threads,
                memory_bytes,
                pool: None,
            }
        }
    }

    impl ComputeDevice for ThreadPoolDevice {
        fn name(&self) -> &str {
            "thread-pool"
        }

        fn memory_bytes(&self) -> u64 {
            self.memory_bytes
        }

        fn is_ready(&self) -> bool {
            self.pool.is_some()
        }

        fn initialize(&mut self) -> Result<(), DeviceError> {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.threads)
                .thread_name(|i| format!("glusignal-device-{i}"))
                .build()
                .map_err(|e| DeviceError::Failure(e.to_string()))?;
            self.pool = Some(pool);
            Ok(())
        }

        fn release(&mut self) -> Result<(), DeviceError> {
            self.pool = None;
            Ok(())
        }

        fn execute(
            &self,
            batch: ArrayView2<'_, f32>,
            kernel: &dyn ColumnKernel,
        ) -> Result<Array2<f32>, DeviceError> {
            let pool = self.pool.as_ref().ok_or(DeviceError::Unavailable)?;
            check_capacity(batch.len(), self.memory_bytes)?;
            Ok(pool.install(|| map_columns(batch, |column| kernel.apply(column))))
        }
    }
}

#[cfg(feature = "parallelism")]
pub use thread_pool::ThreadPoolDevice;
