//! Per-region noise classification and hysteresis threshold derivation.
//!
//! A region's noise level is the standard deviation of its dF/F over the baseline
//! window. The level selects an upper-threshold multiplier, and the lower threshold
//! always uses the same, smaller, multiplier, so `lower < upper` holds for every
//! configuration that passes [`ThresholdConfig::validate`].
use std::fmt;
use std::ops::Range;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::ThresholdConfig;
use crate::stats;

/// Coarse bucketing of regions by baseline variability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NoiseClass {
    Low,
    High,
}

impl fmt::Display for NoiseClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoiseClass::Low => f.write_str("low"),
            NoiseClass::High => f.write_str("high"),
        }
    }
}

/// A region's baseline variability and its class
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NoiseProfile {
    /// Population standard deviation of dF/F over the baseline window
    pub std: f32,
    pub class: NoiseClass,
}

/// The Schmitt-trigger threshold pair of one region.
///
/// Only [`derive_thresholds`] creates one, so the pair is always consistent with a
/// noise profile and a multiplier set.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ThresholdPair {
    upper: f32,
    lower: f32,
}

impl ThresholdPair {
    /// Crossing above this value arms the trigger
    pub fn upper(&self) -> f32 {
        self.upper
    }

    /// Falling below this value ends an event
    pub fn lower(&self) -> f32 {
        self.lower
    }
}

impl fmt::Display for ThresholdPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upper={:.4} lower={:.4}", self.upper, self.lower)
    }
}

/// `Low` iff `std <= noise_cutoff`
pub fn classify(std: f32, noise_cutoff: f32) -> NoiseClass {
    if std <= noise_cutoff {
        NoiseClass::Low
    } else {
        NoiseClass::High
    }
}

/// `upper = std × (low_multiplier | high_multiplier)` by class, `lower = std × lower_multiplier`
pub fn derive_thresholds(
    std: f32,
    class: NoiseClass,
    low_multiplier: f32,
    high_multiplier: f32,
    lower_multiplier: f32,
) -> ThresholdPair {
    let upper = match class {
        NoiseClass::Low => std * low_multiplier,
        NoiseClass::High => std * high_multiplier,
    };
    ThresholdPair {
        upper,
        lower: std * lower_multiplier,
    }
}

/// Derives noise profiles and threshold pairs from normalized regions
#[derive(Debug, Clone)]
pub struct ThresholdCalculator {
    config: ThresholdConfig,
    baseline_window: Range<usize>,
}

impl ThresholdCalculator {
    pub fn new(config: ThresholdConfig, baseline_window: Range<usize>) -> Self {
        Self {
            config,
            baseline_window,
        }
    }

    /// The noise profile of one normalized region
    pub fn noise_profile(&self, signal: &[f32]) -> NoiseProfile {
        let end = self.baseline_window.end.min(signal.len());
        let start = self.baseline_window.start.min(end);
        let std = stats::std_dev(&signal[start..end], 0).unwrap_or(0.0) as f32;
        NoiseProfile {
            std,
            class: classify(std, self.config.noise_cutoff),
        }
    }

    /// The threshold pair for `profile`, deriving from at least the configured noise floor
    pub fn thresholds(&self, profile: &NoiseProfile) -> ThresholdPair {
        let config = &self.config;
        derive_thresholds(
            profile.std.max(config.noise_floor),
            profile.class,
            config.low_noise_multiplier,
            config.high_noise_multiplier,
            config.lower_multiplier,
        )
    }

    pub fn region(&self, signal: &[f32]) -> (NoiseProfile, ThresholdPair) {
        let profile = self.noise_profile(signal);
        let pair = self.thresholds(&profile);
        (profile, pair)
    }
}
