//! `glusignal` separates stimulus-evoked fluorescence responses from noise in
//! recordings of a glutamate sensor.
//!
//! A recording is a frames × regions [`TraceMatrix`] of raw intensity. Each region
//! is normalized to dF/F against a baseline, given a pair of hysteresis thresholds
//! scaled to its own baseline noise, and scanned for responses after the stimulus
//! with a two-threshold trigger. Regions with at least one validated response are
//! retained in the [`FilterResult`].
//!
//! Normalization of large recordings may be offloaded to a [`ComputeDevice`] held in
//! an explicit [`AcceleratorContext`]. The [`ExecutionDispatcher`] decides per call
//! whether that is worthwhile, and any device failure silently falls back to the host.
//!
//! # Usage
//! ```
//! use glusignal::{AnalysisConfig, ResponseFilter, StimulusTiming, TraceMatrix};
//!
//! // 600 frames at 2 ms, stimulus at frame 267, baseline over the first 200 frames
//! let timing = StimulusTiming::single(267, 2.0, 0..200);
//! let config = AnalysisConfig::builder(timing).build().unwrap();
//!
//! let responding: Vec<f32> = (0..600)
//!     .map(|t| if (268..291).contains(&t) { 110.0 } else { 100.0 })
//!     .collect();
//! let silent = vec![100.0f32; 600];
//! let trace = TraceMatrix::from_columns([("roi_a", responding), ("roi_b", silent)]).unwrap();
//!
//! let filter = ResponseFilter::new(config);
//! let analysis = filter.run(&trace, None).unwrap();
//! assert_eq!(analysis.result.region_ids, vec!["roi_a".to_string()]);
//! println!("{}", analysis.result.statistics);
//! ```
//!
//! ## Features
//! - `parallelism` (default) processes regions with `rayon` and provides
//!   [`ThreadPoolDevice`](crate::accelerator::ThreadPoolDevice).
//! - `serde` makes the configuration and the per-region summaries (de)serializable.
pub mod accelerator;
pub mod config;
pub mod detector;
pub mod dispatch;
pub mod filter;
pub mod normalize;
pub mod prelude;
pub mod rolling;
pub mod stats;
pub mod threshold;
pub mod trace;

mod parallel;

#[cfg(test)]
mod test_data;

pub use crate::accelerator::{AcceleratorContext, ComputeDevice, DeviceError, DeviceStatus};
pub use crate::config::{
    AnalysisConfig, AnalysisConfigBuilder, BaselineMethod, ConfigError, DetectionConfig,
    ExecutionConfig, NormalizationConfig, RollingMedianConfig, Stimulus, StimulusTiming,
    ThresholdConfig,
};
pub use crate::detector::{
    EventOutcome, RegionDetection, RejectReason, SearchWindow, SignalDetector, SignalEvent,
};
pub use crate::dispatch::{ExecutionDispatcher, ExecutionPlan, PlanReason};
pub use crate::filter::{
    AnalysisError, FilterResult, FilterStatistics, RegionSummary, ResponseAnalysis, ResponseFilter,
};
pub use crate::normalize::{BaselineNormalizer, NormalizedSignal};
pub use crate::threshold::{NoiseClass, NoiseProfile, ThresholdCalculator, ThresholdPair};
pub use crate::trace::{TraceError, TraceMatrix};
