//! Convert raw intensity into a baseline-relative signal, dF/F.
//!
//! Two baselines are supported:
//! - a fixed F0 per region, the mean over a pre-stimulus window (see
//!   [`compute_fixed_baseline`]), which may run on an accelerator;
//! - a per-frame F0 from an iterative, outlier-rejecting rolling median (see
//!   [`compute_rolling_median_baseline`]), which always runs on the host.
//!
//! Both methods replace any non-finite dF/F value with zero. Every column is
//! processed independently, and the host and accelerated paths share a single
//! column kernel, so chunked, single-shot, host and accelerated runs agree exactly.
use std::ops::Range;

use log::{debug, info, warn};
use ndarray::{s, Array2, ArrayView1, ArrayView2};

use crate::accelerator::{AcceleratorContext, ColumnKernel, ComputeDevice, DeviceError};
use crate::config::{BaselineMethod, NormalizationConfig, RollingMedianConfig};
use crate::dispatch::{ExecutionDispatcher, ExecutionPlan};
use crate::parallel::{map_columns, map_indices};
use crate::rolling::RollingWindow;
use crate::stats;

#[inline]
fn finite_or_zero(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[inline]
fn clamp_f0(f0: f32, min_f0: f32) -> f32 {
    if f0 <= 0.0 {
        min_f0
    } else {
        f0
    }
}

/// F0 for one region: the mean of the finite samples in `window`, clamped to `min_f0`
/// when not positive. `NaN` when the window holds no finite sample.
pub fn baseline_f0(samples: &[f32], window: &Range<usize>, min_f0: f32) -> f32 {
    let end = window.end.min(samples.len());
    let start = window.start.min(end);
    match stats::mean(&samples[start..end]) {
        Some(f0) => clamp_f0(f0 as f32, min_f0),
        None => f32::NAN,
    }
}

/// The fixed-baseline transform of a single region
#[derive(Debug, Clone, PartialEq)]
pub struct FixedBaselineKernel {
    pub baseline_window: Range<usize>,
    pub min_f0: f32,
}

impl ColumnKernel for FixedBaselineKernel {
    fn apply(&self, column: ArrayView1<'_, f32>) -> Vec<f32> {
        let samples = column.to_vec();
        let f0 = baseline_f0(&samples, &self.baseline_window, self.min_f0);
        samples
            .into_iter()
            .map(|x| finite_or_zero((x - f0) / f0))
            .collect()
    }
}

/// Single-shot fixed-baseline dF/F on the host.
///
/// `F0[r]` is the mean of `trace[baseline_window, r]`, replaced by `min_f0` if not
/// positive, and `dF/F[t, r] = (trace[t, r] - F0[r]) / F0[r]`.
pub fn compute_fixed_baseline(
    trace: ArrayView2<'_, f32>,
    baseline_window: &Range<usize>,
    min_f0: f32,
) -> Array2<f32> {
    let kernel = FixedBaselineKernel {
        baseline_window: baseline_window.clone(),
        min_f0,
    };
    map_columns(trace, |column| kernel.apply(column))
}

/// Flag samples whose residual from `baseline` exceeds `sigma` rolling standard deviations.
/// Samples where the rolling deviation is zero are never flagged.
pub fn flag_outliers(
    samples: &[f32],
    baseline: &[f32],
    window: RollingWindow,
    sigma: f32,
) -> Vec<bool> {
    let residual: Vec<f32> = samples
        .iter()
        .zip(baseline.iter())
        .map(|(x, b)| x - b)
        .collect();
    let spread = window.std_dev(&residual);
    residual
        .iter()
        .zip(spread.iter())
        .map(|(r, s)| r.is_finite() && *s > 0.0 && r.abs() > sigma * s)
        .collect()
}

/// Replace each flagged sample with the most recent unflagged one.
///
/// A leading run of flagged samples takes the first unflagged sample of the series.
/// If every sample is flagged the series is returned unchanged.
pub fn forward_fill(samples: &[f32], flags: &[bool]) -> Vec<f32> {
    let seed = samples
        .iter()
        .zip(flags.iter())
        .find(|(_, flagged)| !**flagged)
        .map(|(v, _)| *v);
    let Some(mut last) = seed else {
        return samples.to_vec();
    };
    samples
        .iter()
        .zip(flags.iter())
        .map(|(v, flagged)| {
            if *flagged {
                last
            } else {
                last = *v;
                *v
            }
        })
        .collect()
}

/// The rolling-median baseline of a single region
#[derive(Debug, Clone, PartialEq)]
pub struct RollingBaseline {
    pub signal: Vec<f32>,
    pub baseline: Vec<f32>,
    /// The number of samples flagged by each outlier pass
    pub outlier_counts: Vec<usize>,
}

/// Iteratively estimate a per-frame baseline for one region.
///
/// The first pass is a plain rolling median. Each further pass, up to
/// `params.max_iterations` passes in total, flags outliers against the current
/// baseline, forward-fills them and recomputes the median on the cleaned series,
/// stopping early once a pass flags nothing.
pub fn rolling_median_column(
    samples: &[f32],
    params: &RollingMedianConfig,
    min_f0: f32,
) -> RollingBaseline {
    let window = RollingWindow::new(params.window_frames);
    let mut cleaned = samples.to_vec();
    let mut baseline = window.median(&cleaned);
    let mut outlier_counts = Vec::new();

    for _ in 1..params.max_iterations {
        let flags = flag_outliers(&cleaned, &baseline, window, params.outlier_sigma);
        let flagged = flags.iter().filter(|f| **f).count();
        outlier_counts.push(flagged);
        if flagged == 0 {
            break;
        }
        cleaned = forward_fill(&cleaned, &flags);
        baseline = window.median(&cleaned);
    }

    let baseline: Vec<f32> = baseline
        .into_iter()
        .map(|b| if b.is_nan() { b } else { clamp_f0(b, min_f0) })
        .collect();
    let signal = samples
        .iter()
        .zip(baseline.iter())
        .map(|(x, b)| finite_or_zero((x - b) / b))
        .collect();
    RollingBaseline {
        signal,
        baseline,
        outlier_counts,
    }
}

/// The rolling-median result for a whole matrix
#[derive(Debug, Clone, PartialEq)]
pub struct RollingMedianOutput {
    pub signal: Array2<f32>,
    pub baseline: Array2<f32>,
    /// Per region, the number of samples flagged by each outlier pass
    pub outlier_counts: Vec<Vec<usize>>,
}

/// Rolling-median dF/F for every region of `trace`
pub fn compute_rolling_median_baseline(
    trace: ArrayView2<'_, f32>,
    params: &RollingMedianConfig,
    min_f0: f32,
) -> RollingMedianOutput {
    let (frames, regions) = trace.dim();
    let columns = map_indices(regions, |r| {
        rolling_median_column(&trace.column(r).to_vec(), params, min_f0)
    });
    let mut signal = Array2::zeros((frames, regions));
    let mut baseline = Array2::zeros((frames, regions));
    let mut outlier_counts = Vec::with_capacity(regions);
    for (r, column) in columns.into_iter().enumerate() {
        signal
            .column_mut(r)
            .assign(&ArrayView1::from(column.signal.as_slice()));
        baseline
            .column_mut(r)
            .assign(&ArrayView1::from(column.baseline.as_slice()));
        outlier_counts.push(column.outlier_counts);
    }
    RollingMedianOutput {
        signal,
        baseline,
        outlier_counts,
    }
}

/// How a [`NormalizedSignal`] was actually produced
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    /// What the dispatcher planned
    pub plan: ExecutionPlan,
    /// Whether the result came from the accelerator
    pub accelerated: bool,
    /// Regions per transfer actually used, after any out-of-memory shrinking
    pub chunk_size: usize,
    /// The device failure that forced a host re-run, if any
    pub fallback: Option<DeviceError>,
}

/// A frames × regions dF/F matrix with the diagnostics of its computation
#[derive(Debug, Clone)]
pub struct NormalizedSignal {
    pub data: Array2<f32>,
    pub method: BaselineMethod,
    /// The final per-frame baseline, for the rolling-median method
    pub baseline: Option<Array2<f32>>,
    /// Per region, the samples flagged by each outlier pass, for the rolling-median method
    pub outlier_counts: Vec<Vec<usize>>,
    pub execution: ExecutionRecord,
}

impl NormalizedSignal {
    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn column(&self, region: usize) -> ArrayView1<'_, f32> {
        self.data.column(region)
    }

    pub fn accelerated(&self) -> bool {
        self.execution.accelerated
    }
}

/// Runs the configured baseline method, choosing an execution path for it
#[derive(Debug)]
pub struct BaselineNormalizer {
    baseline_window: Range<usize>,
    config: NormalizationConfig,
    dispatcher: ExecutionDispatcher,
}

impl BaselineNormalizer {
    pub fn new(
        baseline_window: Range<usize>,
        config: NormalizationConfig,
        dispatcher: ExecutionDispatcher,
    ) -> Self {
        Self {
            baseline_window,
            config,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &ExecutionDispatcher {
        &self.dispatcher
    }

    /// Normalize `trace` with the configured method. The caller has already checked
    /// that the baseline window lies within the trace.
    pub fn normalize(
        &self,
        trace: ArrayView2<'_, f32>,
        accelerator: Option<&AcceleratorContext>,
    ) -> NormalizedSignal {
        match &self.config.method {
            BaselineMethod::Fixed => self.fixed(trace, accelerator),
            BaselineMethod::RollingMedian(params) => self.rolling_median(trace, params),
        }
    }

    fn kernel(&self) -> FixedBaselineKernel {
        FixedBaselineKernel {
            baseline_window: self.baseline_window.clone(),
            min_f0: self.config.min_f0,
        }
    }

    /// Fixed-baseline dF/F, on the accelerator when the plan calls for it.
    ///
    /// Any device failure abandons the accelerated attempt entirely and the whole
    /// matrix is recomputed on the host.
    pub fn fixed(
        &self,
        trace: ArrayView2<'_, f32>,
        accelerator: Option<&AcceleratorContext>,
    ) -> NormalizedSignal {
        let (frames, regions) = trace.dim();
        let status = accelerator.map(|a| a.status()).unwrap_or_default();
        let plan = self.dispatcher.decide(frames, regions, status);
        let kernel = self.kernel();

        let device = accelerator.and_then(|a| a.device());
        let mut fallback = None;
        if let (true, Some(device)) = (plan.use_accelerated, device) {
            match run_accelerated(trace, device, &kernel, plan.chunk_size) {
                Ok((data, chunk_size)) => {
                    return NormalizedSignal {
                        data,
                        method: BaselineMethod::Fixed,
                        baseline: None,
                        outlier_counts: Vec::new(),
                        execution: ExecutionRecord {
                            plan,
                            accelerated: true,
                            chunk_size,
                            fallback: None,
                        },
                    };
                }
                Err(err) => {
                    warn!(
                        "Accelerated normalization on {} failed, recomputing on the host: {err}",
                        device.name()
                    );
                    fallback = Some(err);
                }
            }
        }

        let data = map_columns(trace, |column| kernel.apply(column));
        NormalizedSignal {
            data,
            method: BaselineMethod::Fixed,
            baseline: None,
            outlier_counts: Vec::new(),
            execution: ExecutionRecord {
                plan,
                accelerated: false,
                chunk_size: regions,
                fallback,
            },
        }
    }

    /// Rolling-median dF/F, always on the host
    pub fn rolling_median(
        &self,
        trace: ArrayView2<'_, f32>,
        params: &RollingMedianConfig,
    ) -> NormalizedSignal {
        let (frames, regions) = trace.dim();
        debug!(
            "Rolling median baseline over {frames}x{regions} with a {} frame window",
            params.window_frames
        );
        let output = compute_rolling_median_baseline(trace, params, self.config.min_f0);
        let plan = self
            .dispatcher
            .decide(frames, regions, Default::default());
        NormalizedSignal {
            data: output.signal,
            method: BaselineMethod::RollingMedian(*params),
            baseline: Some(output.baseline),
            outlier_counts: output.outlier_counts,
            execution: ExecutionRecord {
                plan,
                accelerated: false,
                chunk_size: regions,
                fallback: None,
            },
        }
    }
}

/// Run `kernel` over `trace` on `device` in column chunks of `chunk_size`, halving the
/// chunk size whenever the device runs out of memory. Returns the result and the chunk
/// size that succeeded.
fn run_accelerated(
    trace: ArrayView2<'_, f32>,
    device: &dyn ComputeDevice,
    kernel: &dyn ColumnKernel,
    chunk_size: usize,
) -> Result<(Array2<f32>, usize), DeviceError> {
    let mut chunk_size = chunk_size.max(1);
    loop {
        match run_chunks(trace, device, kernel, chunk_size) {
            Ok(data) => return Ok((data, chunk_size)),
            Err(DeviceError::OutOfMemory {
                requested,
                available,
            }) if chunk_size > 1 => {
                let smaller = chunk_size / 2;
                info!(
                    "Device needed {requested} bytes with {available} available, \
                     shrinking chunks from {chunk_size} to {smaller} regions"
                );
                chunk_size = smaller;
            }
            Err(err) => return Err(err),
        }
    }
}

fn run_chunks(
    trace: ArrayView2<'_, f32>,
    device: &dyn ComputeDevice,
    kernel: &dyn ColumnKernel,
    chunk_size: usize,
) -> Result<Array2<f32>, DeviceError> {
    let (frames, regions) = trace.dim();
    let mut out = Array2::zeros((frames, regions));
    let mut start = 0;
    while start < regions {
        let end = (start + chunk_size).min(regions);
        let part = device.execute(trace.slice(s![.., start..end]), kernel)?;
        if part.dim() != (frames, end - start) {
            return Err(DeviceError::Failure(format!(
                "expected a {}x{} result, received {:?}",
                frames,
                end - start,
                part.dim()
            )));
        }
        out.slice_mut(s![.., start..end]).assign(&part);
        start = end;
    }
    Ok(out)
}
