//! Decide whether a normalization pass should run on the host or on an accelerator,
//! and how many regions each accelerated transfer may carry.
//!
//! The break-even estimate comes from a [`CostModel`]. The default
//! [`ThroughputCostModel`] is a linear model over assumed transfer bandwidth and
//! compute throughput; hardware-calibrated figures can be swapped in without touching
//! the decision rule.
use std::fmt::{self, Debug};
use std::ops::Range;

use log::debug;

use crate::accelerator::DeviceStatus;
use crate::config::ExecutionConfig;

/// Estimates how long a pass over a matrix takes on each execution path
pub trait CostModel: Debug + Send + Sync {
    /// Seconds to process `elements` samples on the host
    fn host_seconds(&self, elements: usize) -> f64;

    /// Seconds to transfer `elements` samples to the device, process them and transfer
    /// the result back
    fn device_seconds(&self, elements: usize, bytes_per_element: usize) -> f64;
}

/// A linear cost model parameterized by throughput figures
#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputCostModel {
    /// Host↔device bandwidth in bytes per second, each direction
    pub transfer_bytes_per_second: f64,
    /// Samples per second processed on the device
    pub device_elements_per_second: f64,
    /// Samples per second processed on the host
    pub host_elements_per_second: f64,
    /// Fixed cost of launching work on the device, in seconds
    pub launch_overhead_seconds: f64,
}

impl Default for ThroughputCostModel {
    fn default() -> Self {
        Self {
            transfer_bytes_per_second: 12.0e9,
            device_elements_per_second: 5.0e9,
            host_elements_per_second: 2.0e8,
            launch_overhead_seconds: 5.0e-4,
        }
    }
}

impl CostModel for ThroughputCostModel {
    fn host_seconds(&self, elements: usize) -> f64 {
        elements as f64 / self.host_elements_per_second
    }

    fn device_seconds(&self, elements: usize, bytes_per_element: usize) -> f64 {
        let bytes = (elements * bytes_per_element) as f64;
        self.launch_overhead_seconds
            + 2.0 * bytes / self.transfer_bytes_per_second
            + elements as f64 / self.device_elements_per_second
    }
}

/// Why an [`ExecutionPlan`] was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanReason {
    /// No device was offered, or it is not ready
    NoDevice,
    /// The matrix is smaller than the accelerated minimum
    BelowMinimumSize,
    /// The cost model predicts too small a saving
    InsufficientSpeedup,
    /// Not even one region fits the device memory budget
    ColumnExceedsMemory,
    /// The whole matrix moves in one transfer
    SingleTransfer,
    /// The matrix moves in column chunks
    Chunked,
}

impl fmt::Display for PlanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PlanReason::NoDevice => "no device available",
            PlanReason::BelowMinimumSize => "below accelerated minimum size",
            PlanReason::InsufficientSpeedup => "insufficient projected speedup",
            PlanReason::ColumnExceedsMemory => "a single region exceeds the memory budget",
            PlanReason::SingleTransfer => "single transfer",
            PlanReason::Chunked => "chunked transfers",
        };
        f.write_str(text)
    }
}

/// The outcome of [`ExecutionDispatcher::decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub use_accelerated: bool,
    /// Regions per transfer. Equal to the region count for host plans and single transfers.
    pub chunk_size: usize,
    /// Projected device footprint of the whole matrix including intermediates, in bytes
    pub estimated_bytes: u64,
    pub reason: PlanReason,
}

impl ExecutionPlan {
    fn host(regions: usize, estimated_bytes: u64, reason: PlanReason) -> Self {
        Self {
            use_accelerated: false,
            chunk_size: regions.max(1),
            estimated_bytes,
            reason,
        }
    }

    /// The region ranges each transfer covers, in column order
    pub fn chunks(&self, regions: usize) -> impl Iterator<Item = Range<usize>> {
        let step = self.chunk_size.max(1);
        (0..regions)
            .step_by(step)
            .map(move |start| start..(start + step).min(regions))
    }

    pub fn n_chunks(&self, regions: usize) -> usize {
        regions.div_ceil(self.chunk_size.max(1))
    }
}

/// Chooses an execution path from the data volume and the device's memory budget
#[derive(Debug)]
pub struct ExecutionDispatcher {
    config: ExecutionConfig,
    cost_model: Box<dyn CostModel>,
}

impl ExecutionDispatcher {
    pub fn new(config: ExecutionConfig) -> Self {
        Self::with_cost_model(config, ThroughputCostModel::default())
    }

    pub fn with_cost_model<M: CostModel + 'static>(config: ExecutionConfig, cost_model: M) -> Self {
        Self {
            config,
            cost_model: Box::new(cost_model),
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Plan a pass over a `frames` × `regions` matrix given what is known of the device.
    pub fn decide(&self, frames: usize, regions: usize, device: DeviceStatus) -> ExecutionPlan {
        let plan = self.plan(frames, regions, device);
        debug!(
            "Execution plan for {frames}x{regions}: accelerated={} chunk_size={} ({})",
            plan.use_accelerated, plan.chunk_size, plan.reason
        );
        plan
    }

    fn plan(&self, frames: usize, regions: usize, device: DeviceStatus) -> ExecutionPlan {
        let config = &self.config;
        let data_size = frames * regions;
        let bytes_per_column =
            (frames * config.bytes_per_element) as f64 * config.memory_safety_factor;
        let estimated = bytes_per_column * regions as f64;
        let estimated_bytes = estimated as u64;

        if !device.available {
            return ExecutionPlan::host(regions, estimated_bytes, PlanReason::NoDevice);
        }
        if data_size < config.min_accelerated_size {
            return ExecutionPlan::host(regions, estimated_bytes, PlanReason::BelowMinimumSize);
        }

        let host_time = self.cost_model.host_seconds(data_size);
        let device_time = self
            .cost_model
            .device_seconds(data_size, config.bytes_per_element);
        let beneficial = device_time < host_time * (1.0 - config.min_speedup)
            || data_size > config.large_dataset_override;
        if !beneficial {
            return ExecutionPlan::host(regions, estimated_bytes, PlanReason::InsufficientSpeedup);
        }

        let budget = device.memory_bytes as f64 * config.memory_fraction;
        if estimated <= budget {
            return ExecutionPlan {
                use_accelerated: true,
                chunk_size: regions,
                estimated_bytes,
                reason: PlanReason::SingleTransfer,
            };
        }

        let columns = (budget / bytes_per_column).floor() as usize;
        if columns == 0 {
            ExecutionPlan::host(regions, estimated_bytes, PlanReason::ColumnExceedsMemory)
        } else {
            ExecutionPlan {
                use_accelerated: true,
                chunk_size: columns.min(regions),
                estimated_bytes,
                reason: PlanReason::Chunked,
            }
        }
    }
}

impl Default for ExecutionDispatcher {
    fn default() -> Self {
        Self::new(ExecutionConfig::default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const GIB: u64 = 1 << 30;

    fn device(memory_bytes: u64) -> DeviceStatus {
        DeviceStatus {
            available: true,
            memory_bytes,
        }
    }

    #[derive(Debug)]
    struct FixedCost {
        host: f64,
        device: f64,
    }

    impl CostModel for FixedCost {
        fn host_seconds(&self, _elements: usize) -> f64 {
            self.host
        }

        fn device_seconds(&self, _elements: usize, _bytes_per_element: usize) -> f64 {
            self.device
        }
    }

    #[test]
    fn test_below_minimum_stays_on_host() {
        let dispatcher = ExecutionDispatcher::default();
        let plan = dispatcher.decide(600, 100, device(GIB));
        assert!(!plan.use_accelerated);
        assert_eq!(plan.reason, PlanReason::BelowMinimumSize);
        assert_eq!(plan.chunk_size, 100);
    }

    #[test]
    fn test_no_device() {
        let dispatcher = ExecutionDispatcher::default();
        let plan = dispatcher.decide(2000, 1000, DeviceStatus::unavailable());
        assert!(!plan.use_accelerated);
        assert_eq!(plan.reason, PlanReason::NoDevice);
    }

    #[test]
    fn test_fits_and_beneficial() {
        let dispatcher = ExecutionDispatcher::default();
        let plan = dispatcher.decide(2000, 1000, device(GIB));
        assert!(plan.use_accelerated);
        assert_eq!(plan.reason, PlanReason::SingleTransfer);
        assert_eq!(plan.chunk_size, 1000);
        assert_eq!(plan.estimated_bytes, 24_000_000);
    }

    #[test]
    fn test_insufficient_speedup() {
        let config = ExecutionConfig::default().min_speedup(0.5);
        let dispatcher =
            ExecutionDispatcher::with_cost_model(config, FixedCost { host: 1.0, device: 0.6 });
        let plan = dispatcher.decide(2000, 1000, device(GIB));
        assert!(!plan.use_accelerated);
        assert_eq!(plan.reason, PlanReason::InsufficientSpeedup);

        let config = ExecutionConfig::default()
            .min_speedup(0.5)
            .large_dataset_override(1_000_000);
        let dispatcher =
            ExecutionDispatcher::with_cost_model(config, FixedCost { host: 1.0, device: 0.6 });
        let plan = dispatcher.decide(2000, 1000, device(GIB));
        assert!(plan.use_accelerated);
    }

    #[test]
    fn test_chunking_respects_budget() {
        let config = ExecutionConfig::default().memory_fraction(0.5);
        let dispatcher = ExecutionDispatcher::new(config);
        // Each column needs 2000 * 4 * 3 = 24kB, the budget is 1.2MB
        let plan = dispatcher.decide(2000, 1000, device(2_400_000));
        assert!(plan.use_accelerated);
        assert_eq!(plan.reason, PlanReason::Chunked);
        assert_eq!(plan.chunk_size, 50);
        assert_eq!(plan.n_chunks(1000), 20);

        let chunks: Vec<_> = plan.chunks(120).collect();
        assert_eq!(chunks, vec![0..50, 50..100, 100..120]);

        let plan = dispatcher.decide(2000, 1000, device(1_000));
        assert!(!plan.use_accelerated);
        assert_eq!(plan.reason, PlanReason::ColumnExceedsMemory);
    }
}
