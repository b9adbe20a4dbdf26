//! Configuration for a response analysis.
//!
//! All tunable constants live here rather than in the algorithms that consume them.
//! The detection constants in particular are tuned to one sensor's kinetics, and
//! experiments with different indicators are expected to override them.
//!
//! An [`AnalysisConfig`] can only be obtained through [`AnalysisConfigBuilder::build`]
//! (or deserialization, which routes through the same builder), so every value that
//! reaches the normalizer, threshold calculator and detector has been range-checked.
use std::ops::Range;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use thiserror::Error;

/// All the ways a configuration can be rejected
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("The baseline window {start}..{end} is empty")]
    EmptyBaselineWindow { start: usize, end: usize },
    #[error("{field} must be a finite number greater than zero, received {value}")]
    NotPositive { field: &'static str, value: f64 },
    #[error("{field} must lie within [{min}, {max}], received {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{field} must be at least one frame")]
    ZeroFrames { field: &'static str },
    #[error(
        "The lower threshold multiplier {lower} must be smaller than the {class} noise multiplier {upper}"
    )]
    LowerMultiplierTooLarge {
        lower: f32,
        upper: f32,
        class: &'static str,
    },
    #[error("The second stimulus frame {second} must come after the first stimulus frame {first}")]
    PairedStimulusOrder { first: usize, second: usize },
}

fn check_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

fn check_frames(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::ZeroFrames { field })
    } else {
        Ok(())
    }
}

/// When the stimulus (or stimuli) arrived, in frames from the start of the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Stimulus {
    /// A single stimulus onset
    Single { frame: usize },
    /// A paired-pulse protocol with two closely spaced onsets
    Paired { first: usize, second: usize },
}

/// Experiment timing supplied by the caller. Nothing in this crate infers these values.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StimulusTiming {
    pub stimulus: Stimulus,
    /// Milliseconds between consecutive frames
    pub frame_interval_ms: f64,
    /// The pre-stimulus frames, 0-based and half-open, from which F0 and the noise
    /// level are estimated
    pub baseline_window: Range<usize>,
}

impl StimulusTiming {
    pub fn single(frame: usize, frame_interval_ms: f64, baseline_window: Range<usize>) -> Self {
        Self {
            stimulus: Stimulus::Single { frame },
            frame_interval_ms,
            baseline_window,
        }
    }

    pub fn paired(
        first: usize,
        second: usize,
        frame_interval_ms: f64,
        baseline_window: Range<usize>,
    ) -> Self {
        Self {
            stimulus: Stimulus::Paired { first, second },
            frame_interval_ms,
            baseline_window,
        }
    }

    /// Convert a frame count into milliseconds
    pub fn frames_to_ms(&self, frames: usize) -> f64 {
        frames as f64 * self.frame_interval_ms
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("frame_interval_ms", self.frame_interval_ms)?;
        if self.baseline_window.start >= self.baseline_window.end {
            return Err(ConfigError::EmptyBaselineWindow {
                start: self.baseline_window.start,
                end: self.baseline_window.end,
            });
        }
        if let Stimulus::Paired { first, second } = self.stimulus {
            if second <= first {
                return Err(ConfigError::PairedStimulusOrder { first, second });
            }
        }
        Ok(())
    }
}

/// Parameters of the iterative rolling-median baseline
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RollingMedianConfig {
    /// The nominal width of the centered window, in frames
    pub window_frames: usize,
    /// How many rolling standard deviations a residual may stray before the sample
    /// is treated as an outlier
    pub outlier_sigma: f32,
    /// The maximum number of median passes. A single pass performs no outlier replacement.
    pub max_iterations: usize,
}

impl Default for RollingMedianConfig {
    fn default() -> Self {
        Self {
            window_frames: 101,
            outlier_sigma: 3.0,
            max_iterations: 3,
        }
    }
}

impl RollingMedianConfig {
    pub fn window_frames(mut self, window_frames: usize) -> Self {
        self.window_frames = window_frames;
        self
    }

    pub fn outlier_sigma(mut self, outlier_sigma: f32) -> Self {
        self.outlier_sigma = outlier_sigma;
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_frames("window_frames", self.window_frames)?;
        check_positive("outlier_sigma", self.outlier_sigma as f64)?;
        check_frames("max_iterations", self.max_iterations)
    }
}

/// How the per-frame baseline F0 is obtained
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BaselineMethod {
    /// A single F0 per region, the mean over the baseline window
    #[default]
    Fixed,
    /// A per-frame F0 from an outlier-rejecting rolling median
    RollingMedian(RollingMedianConfig),
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NormalizationConfig {
    /// The value substituted for a non-positive F0
    pub min_f0: f32,
    pub method: BaselineMethod,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            min_f0: 1.0,
            method: BaselineMethod::Fixed,
        }
    }
}

impl NormalizationConfig {
    pub fn min_f0(mut self, min_f0: f32) -> Self {
        self.min_f0 = min_f0;
        self
    }

    pub fn method(mut self, method: BaselineMethod) -> Self {
        self.method = method;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("min_f0", self.min_f0 as f64)?;
        match &self.method {
            BaselineMethod::Fixed => Ok(()),
            BaselineMethod::RollingMedian(params) => params.validate(),
        }
    }
}

/// Noise classification and hysteresis threshold multipliers
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ThresholdConfig {
    /// Regions whose baseline σ is at or below this value are low-noise
    pub noise_cutoff: f32,
    /// The upper threshold in units of σ for low-noise regions
    pub low_noise_multiplier: f32,
    /// The upper threshold in units of σ for high-noise regions
    pub high_noise_multiplier: f32,
    /// The lower threshold in units of σ, for either class
    pub lower_multiplier: f32,
    /// The smallest σ used to derive thresholds, so a noiseless baseline still
    /// gets a non-degenerate threshold pair
    pub noise_floor: f32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            noise_cutoff: 0.02,
            low_noise_multiplier: 3.0,
            high_noise_multiplier: 2.5,
            lower_multiplier: 0.5,
            noise_floor: 0.005,
        }
    }
}

impl ThresholdConfig {
    pub fn noise_cutoff(mut self, noise_cutoff: f32) -> Self {
        self.noise_cutoff = noise_cutoff;
        self
    }

    pub fn low_noise_multiplier(mut self, value: f32) -> Self {
        self.low_noise_multiplier = value;
        self
    }

    pub fn high_noise_multiplier(mut self, value: f32) -> Self {
        self.high_noise_multiplier = value;
        self
    }

    pub fn lower_multiplier(mut self, value: f32) -> Self {
        self.lower_multiplier = value;
        self
    }

    pub fn noise_floor(mut self, noise_floor: f32) -> Self {
        self.noise_floor = noise_floor;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("noise_cutoff", self.noise_cutoff as f64)?;
        check_positive("low_noise_multiplier", self.low_noise_multiplier as f64)?;
        check_positive("high_noise_multiplier", self.high_noise_multiplier as f64)?;
        check_positive("lower_multiplier", self.lower_multiplier as f64)?;
        check_positive("noise_floor", self.noise_floor as f64)?;
        for (upper, class) in [
            (self.low_noise_multiplier, "low"),
            (self.high_noise_multiplier, "high"),
        ] {
            if self.lower_multiplier >= upper {
                return Err(ConfigError::LowerMultiplierTooLarge {
                    lower: self.lower_multiplier,
                    upper,
                    class,
                });
            }
        }
        Ok(())
    }
}

/// Search windows and event validation constants for the Schmitt-trigger detector
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DetectionConfig {
    /// Frames searched after a single stimulus
    pub single_window_frames: usize,
    /// Frames searched after the first and second stimulus of a paired-pulse protocol
    pub paired_window_frames: (usize, usize),
    /// How far past an onset to look for the signal to fall below the lower threshold
    pub decay_horizon: usize,
    /// Events lasting this many frames or fewer are rejected
    pub min_duration: usize,
    /// The event peak must reach the upper threshold times this factor
    pub peak_amplitude_factor: f32,
    /// The largest tolerated ratio of second-half to first-half mean amplitude
    pub max_decay_ratio: f32,
    /// The largest tolerated coefficient of variation over an event
    pub max_noise_ratio: f32,
    /// Events lasting this many frames or fewer are accepted on amplitude alone
    pub short_signal_cutoff: usize,
    /// Regions with more upper-threshold crossings than this are treated as noise
    pub max_crossings: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            single_window_frames: 50,
            paired_window_frames: (50, 50),
            decay_horizon: 50,
            min_duration: 0,
            peak_amplitude_factor: 1.0,
            max_decay_ratio: 1.2,
            max_noise_ratio: 1.5,
            short_signal_cutoff: 3,
            max_crossings: 20,
        }
    }
}

impl DetectionConfig {
    pub fn single_window_frames(mut self, frames: usize) -> Self {
        self.single_window_frames = frames;
        self
    }

    pub fn paired_window_frames(mut self, first: usize, second: usize) -> Self {
        self.paired_window_frames = (first, second);
        self
    }

    pub fn decay_horizon(mut self, frames: usize) -> Self {
        self.decay_horizon = frames;
        self
    }

    pub fn min_duration(mut self, frames: usize) -> Self {
        self.min_duration = frames;
        self
    }

    pub fn peak_amplitude_factor(mut self, factor: f32) -> Self {
        self.peak_amplitude_factor = factor;
        self
    }

    pub fn max_decay_ratio(mut self, ratio: f32) -> Self {
        self.max_decay_ratio = ratio;
        self
    }

    pub fn max_noise_ratio(mut self, ratio: f32) -> Self {
        self.max_noise_ratio = ratio;
        self
    }

    pub fn short_signal_cutoff(mut self, frames: usize) -> Self {
        self.short_signal_cutoff = frames;
        self
    }

    pub fn max_crossings(mut self, crossings: usize) -> Self {
        self.max_crossings = crossings;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_frames("single_window_frames", self.single_window_frames)?;
        check_frames("paired_window_frames.0", self.paired_window_frames.0)?;
        check_frames("paired_window_frames.1", self.paired_window_frames.1)?;
        check_frames("decay_horizon", self.decay_horizon)?;
        check_positive("peak_amplitude_factor", self.peak_amplitude_factor as f64)?;
        check_positive("max_decay_ratio", self.max_decay_ratio as f64)?;
        check_positive("max_noise_ratio", self.max_noise_ratio as f64)?;
        Ok(())
    }
}

/// Limits that steer the choice between host and accelerated execution
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExecutionConfig {
    /// Matrices with fewer elements than this always run on the host
    pub min_accelerated_size: usize,
    /// The share of device memory a single transfer may occupy
    pub memory_fraction: f64,
    /// The fraction of host time the accelerator must save to be worth using
    pub min_speedup: f64,
    /// Bytes per stored sample
    pub bytes_per_element: usize,
    /// Multiplier on the raw matrix footprint covering the intermediates of a pass
    pub memory_safety_factor: f64,
    /// Matrices with more elements than this go to the accelerator even when the
    /// cost model predicts no gain
    pub large_dataset_override: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            min_accelerated_size: 1_000_000,
            memory_fraction: 0.8,
            min_speedup: 0.2,
            bytes_per_element: std::mem::size_of::<f32>(),
            memory_safety_factor: 3.0,
            large_dataset_override: 100_000_000,
        }
    }
}

impl ExecutionConfig {
    pub fn min_accelerated_size(mut self, elements: usize) -> Self {
        self.min_accelerated_size = elements;
        self
    }

    pub fn memory_fraction(mut self, fraction: f64) -> Self {
        self.memory_fraction = fraction;
        self
    }

    pub fn min_speedup(mut self, margin: f64) -> Self {
        self.min_speedup = margin;
        self
    }

    pub fn memory_safety_factor(mut self, factor: f64) -> Self {
        self.memory_safety_factor = factor;
        self
    }

    pub fn large_dataset_override(mut self, elements: usize) -> Self {
        self.large_dataset_override = elements;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("memory_fraction", self.memory_fraction)?;
        check_range("memory_fraction", self.memory_fraction, 0.0, 1.0)?;
        check_range("min_speedup", self.min_speedup, 0.0, 0.999)?;
        check_frames("bytes_per_element", self.bytes_per_element)?;
        check_range(
            "memory_safety_factor",
            self.memory_safety_factor,
            1.0,
            f64::MAX,
        )
    }
}

/// A complete, validated analysis configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "AnalysisConfigBuilder"))]
pub struct AnalysisConfig {
    timing: StimulusTiming,
    normalization: NormalizationConfig,
    thresholds: ThresholdConfig,
    detection: DetectionConfig,
    execution: ExecutionConfig,
}

impl AnalysisConfig {
    /// Start building a configuration around the experiment's timing
    pub fn builder(timing: StimulusTiming) -> AnalysisConfigBuilder {
        AnalysisConfigBuilder::new(timing)
    }

    pub fn timing(&self) -> &StimulusTiming {
        &self.timing
    }

    pub fn normalization(&self) -> &NormalizationConfig {
        &self.normalization
    }

    pub fn thresholds(&self) -> &ThresholdConfig {
        &self.thresholds
    }

    pub fn detection(&self) -> &DetectionConfig {
        &self.detection
    }

    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }
}

/// A builder for configuring [`AnalysisConfig`]
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AnalysisConfigBuilder {
    timing: StimulusTiming,
    #[cfg_attr(feature = "serde", serde(default))]
    normalization: NormalizationConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    thresholds: ThresholdConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    detection: DetectionConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    execution: ExecutionConfig,
}

impl AnalysisConfigBuilder {
    pub fn new(timing: StimulusTiming) -> Self {
        Self {
            timing,
            normalization: NormalizationConfig::default(),
            thresholds: ThresholdConfig::default(),
            detection: DetectionConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }

    pub fn normalization(mut self, normalization: NormalizationConfig) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn thresholds(mut self, thresholds: ThresholdConfig) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn detection(mut self, detection: DetectionConfig) -> Self {
        self.detection = detection;
        self
    }

    pub fn execution(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }

    /// Validate every section and produce the configuration
    pub fn build(self) -> Result<AnalysisConfig, ConfigError> {
        self.timing.validate()?;
        self.normalization.validate()?;
        self.thresholds.validate()?;
        self.detection.validate()?;
        self.execution.validate()?;
        Ok(AnalysisConfig {
            timing: self.timing,
            normalization: self.normalization,
            thresholds: self.thresholds,
            detection: self.detection,
            execution: self.execution,
        })
    }
}

impl TryFrom<AnalysisConfigBuilder> for AnalysisConfig {
    type Error = ConfigError;

    fn try_from(value: AnalysisConfigBuilder) -> Result<Self, Self::Error> {
        value.build()
    }
}
