use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::accelerator::{check_capacity, ColumnKernel, ComputeDevice, DeviceError};
use crate::parallel::map_columns;
use crate::trace::TraceMatrix;

/// A flat trace at `f0` that steps to `level` over `step`
pub fn step_response(frames: usize, f0: f32, step: Range<usize>, level: f32) -> Vec<f32> {
    (0..frames)
        .map(|t| if step.contains(&t) { level } else { f0 })
        .collect()
}

/// Gaussian noise around `f0`, with each region offset so no two columns share an F0
pub fn noisy_matrix(frames: usize, regions: usize, f0: f32, sigma: f32, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0f32, sigma).unwrap();
    let mut data = Array2::zeros((frames, regions));
    for r in 0..regions {
        for t in 0..frames {
            data[[t, r]] = f0 + r as f32 + noise.sample(&mut rng);
        }
    }
    data
}

/// Strictly positive traces with a slow linear drift and unit noise
pub fn drifting_matrix(frames: usize, regions: usize, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0f32, 1.0).unwrap();
    Array2::from_shape_fn((frames, regions), |(t, r)| {
        100.0 + 10.0 * r as f32 + 0.05 * t as f32 + noise.sample(&mut rng)
    })
}

/// A noisy trace at `f0` with an exponentially decaying response of relative
/// `amplitude` and time constant `tau` frames beginning at `onset`
pub fn evoked_response(
    frames: usize,
    f0: f32,
    sigma: f32,
    onset: usize,
    amplitude: f32,
    tau: f32,
    seed: u64,
) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0f32, sigma).unwrap();
    (0..frames)
        .map(|t| {
            let response = if t >= onset {
                amplitude * (-((t - onset) as f32) / tau).exp()
            } else {
                0.0
            };
            f0 * (1.0 + response) + noise.sample(&mut rng)
        })
        .collect()
}

/// A zero trace with `count` one-frame pulses of `amplitude` every other frame from `start`
pub fn chattering(frames: usize, start: usize, count: usize, amplitude: f32) -> Vec<f32> {
    let mut trace = vec![0.0f32; frames];
    for i in 0..count {
        trace[start + 2 * i] = amplitude;
    }
    trace
}

pub fn region_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("roi_{i}")).collect()
}

/// Assemble a trace matrix from equal-length columns named `roi_0`, `roi_1`, …
pub fn trace_matrix(columns: Vec<Vec<f32>>) -> TraceMatrix {
    let ids = region_ids(columns.len());
    TraceMatrix::from_columns(ids.into_iter().zip(columns)).unwrap()
}

/// A host-emulated device that can be told to fail
#[derive(Debug)]
pub struct EmulatedDevice {
    memory_bytes: u64,
    usable_bytes: u64,
    fail_after: Option<usize>,
    calls: AtomicUsize,
}

impl EmulatedDevice {
    pub fn new(memory_bytes: u64) -> Self {
        Self {
            memory_bytes,
            usable_bytes: memory_bytes,
            fail_after: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Reports `memory_bytes` to the planner but only accepts batches of `usable_bytes`
    pub fn over_reporting(memory_bytes: u64, usable_bytes: u64) -> Self {
        Self {
            usable_bytes,
            ..Self::new(memory_bytes)
        }
    }

    /// Fails every call after the first `calls`
    pub fn failing_after(memory_bytes: u64, calls: usize) -> Self {
        Self {
            fail_after: Some(calls),
            ..Self::new(memory_bytes)
        }
    }
}

impl ComputeDevice for EmulatedDevice {
    fn name(&self) -> &str {
        "emulated"
    }

    fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }

    fn execute(
        &self,
        batch: ArrayView2<'_, f32>,
        kernel: &dyn ColumnKernel,
    ) -> Result<Array2<f32>, DeviceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_after {
            if call >= limit {
                return Err(DeviceError::Failure("simulated fault".to_string()));
            }
        }
        check_capacity(batch.len(), self.usable_bytes)?;
        Ok(map_columns(batch, |column| kernel.apply(column)))
    }
}
