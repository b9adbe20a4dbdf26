//! The end-to-end response filter: normalize every region, derive its thresholds, scan
//! it for validated responses, and keep only the regions that respond.
//!
//! [`ResponseFilter::run`] fails only for malformed input. Accelerator trouble is absorbed
//! by the normalizer, and a run in which no region responds produces an empty
//! [`FilterResult`] whose [`FilterStatistics`] explain why.
use std::fmt;

use log::{debug, info};
use ndarray::{Array2, Axis};
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::accelerator::AcceleratorContext;
use crate::config::{AnalysisConfig, AnalysisConfigBuilder, ConfigError};
use crate::detector::{RegionDetection, SearchWindow, SignalDetector};
use crate::dispatch::{CostModel, ExecutionDispatcher};
use crate::normalize::{BaselineNormalizer, NormalizedSignal};
use crate::parallel::map_indices;
use crate::threshold::{NoiseClass, NoiseProfile, ThresholdCalculator, ThresholdPair};
use crate::trace::{TraceError, TraceMatrix};

/// The errors that halt an analysis
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error("Invalid input: {0}")]
    InvalidInput(#[from] TraceError),
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigError),
}

/// Everything derived for one analysed region
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct RegionSummary {
    /// The region's column in the input matrix
    pub index: usize,
    pub id: String,
    pub noise: NoiseProfile,
    pub thresholds: ThresholdPair,
    pub detection: RegionDetection,
}

/// Analysed and passing region counts for one noise class
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct NoiseClassCounts {
    pub total: usize,
    pub passed: usize,
}

/// Counts and rates describing a filtering run
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct FilterStatistics {
    pub total_regions: usize,
    /// Regions dropped before analysis because no sample was finite
    pub excluded_regions: usize,
    pub analysed_regions: usize,
    pub passed_regions: usize,
    pub failed_regions: usize,
    pub low_noise: NoiseClassCounts,
    pub high_noise: NoiseClassCounts,
    /// Analysed regions with at least one upper-threshold crossing
    pub triggered_regions: usize,
    pub excessive_crossing_regions: usize,
    pub empty_window_regions: usize,
    pub total_events: usize,
    pub valid_events: usize,
    /// Whether normalization ran on the accelerator
    pub accelerated: bool,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl FilterStatistics {
    fn from_regions(
        total_regions: usize,
        excluded_regions: usize,
        regions: &[RegionSummary],
        accelerated: bool,
    ) -> Self {
        let mut stats = Self {
            total_regions,
            excluded_regions,
            analysed_regions: regions.len(),
            accelerated,
            ..Default::default()
        };
        for region in regions {
            let detection = &region.detection;
            let class = match region.noise.class {
                NoiseClass::Low => &mut stats.low_noise,
                NoiseClass::High => &mut stats.high_noise,
            };
            class.total += 1;
            if detection.passed {
                class.passed += 1;
                stats.passed_regions += 1;
            } else {
                stats.failed_regions += 1;
            }
            if detection.triggered() {
                stats.triggered_regions += 1;
            }
            if detection.excessive_crossings {
                stats.excessive_crossing_regions += 1;
            }
            if detection.empty_window {
                stats.empty_window_regions += 1;
            }
            stats.total_events += detection.total_events();
            stats.valid_events += detection.valid_events;
        }
        stats
    }

    /// The share of analysed regions that crossed the upper threshold at least once
    pub fn trigger_rate(&self) -> f64 {
        ratio(self.triggered_regions, self.analysed_regions)
    }

    /// The share of candidate events that were valid
    pub fn validity_rate(&self) -> f64 {
        ratio(self.valid_events, self.total_events)
    }

    /// The share of analysed regions that passed
    pub fn pass_rate(&self) -> f64 {
        ratio(self.passed_regions, self.analysed_regions)
    }

    pub fn summary(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FilterStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} of {} regions passed ({:.1}%), {} failed, {} excluded as non-finite",
            self.passed_regions,
            self.analysed_regions,
            self.pass_rate() * 100.0,
            self.failed_regions,
            self.excluded_regions,
        )?;
        writeln!(
            f,
            "low noise: {}/{} passed, high noise: {}/{} passed",
            self.low_noise.passed, self.low_noise.total, self.high_noise.passed, self.high_noise.total,
        )?;
        writeln!(
            f,
            "trigger rate {:.1}%, validity rate {:.1}% ({} of {} events)",
            self.trigger_rate() * 100.0,
            self.validity_rate() * 100.0,
            self.valid_events,
            self.total_events,
        )?;
        write!(
            f,
            "{} rejected for excessive crossings, {} with an empty search window, {} execution",
            self.excessive_crossing_regions,
            self.empty_window_regions,
            if self.accelerated { "accelerated" } else { "host" },
        )
    }
}

/// The regions that responded, with their signals and thresholds.
///
/// `region_ids`, the columns of `signal` and `thresholds` are positionally aligned.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterResult {
    pub region_ids: Vec<String>,
    pub signal: Array2<f32>,
    pub thresholds: Vec<ThresholdPair>,
    pub statistics: FilterStatistics,
}

impl FilterResult {
    pub fn len(&self) -> usize {
        self.region_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region_ids.is_empty()
    }
}

/// The full output of [`ResponseFilter::run`]
#[derive(Debug, Clone)]
pub struct ResponseAnalysis {
    /// dF/F for every input region, retained or not
    pub normalized: NormalizedSignal,
    /// One entry per analysed region, in input order
    pub regions: Vec<RegionSummary>,
    pub result: FilterResult,
}

/// Runs the whole analysis for one configuration.
///
/// A filter holds no per-run state, so one instance may analyse any number of trace
/// matrices, concurrently if desired.
#[derive(Debug)]
pub struct ResponseFilter {
    config: AnalysisConfig,
    normalizer: BaselineNormalizer,
    calculator: ThresholdCalculator,
    detector: SignalDetector,
}

impl ResponseFilter {
    pub fn new(config: AnalysisConfig) -> Self {
        let dispatcher = ExecutionDispatcher::new(config.execution().clone());
        Self::with_dispatcher(config, dispatcher)
    }

    /// Validate `builder` and create a filter from it
    pub fn from_builder(builder: AnalysisConfigBuilder) -> Result<Self, AnalysisError> {
        Ok(Self::new(builder.build()?))
    }

    /// A filter whose dispatcher plans with `cost_model`
    pub fn with_cost_model<M: CostModel + 'static>(config: AnalysisConfig, cost_model: M) -> Self {
        let dispatcher = ExecutionDispatcher::with_cost_model(config.execution().clone(), cost_model);
        Self::with_dispatcher(config, dispatcher)
    }

    fn with_dispatcher(config: AnalysisConfig, dispatcher: ExecutionDispatcher) -> Self {
        let timing = config.timing();
        let normalizer = BaselineNormalizer::new(
            timing.baseline_window.clone(),
            config.normalization().clone(),
            dispatcher,
        );
        let calculator =
            ThresholdCalculator::new(config.thresholds().clone(), timing.baseline_window.clone());
        let detector = SignalDetector::new(config.detection().clone(), timing.frame_interval_ms);
        Self {
            config,
            normalizer,
            calculator,
            detector,
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Analyse `trace`, using `accelerator` for normalization when it is worthwhile
    pub fn run(
        &self,
        trace: &TraceMatrix,
        accelerator: Option<&AcceleratorContext>,
    ) -> Result<ResponseAnalysis, AnalysisError> {
        let timing = self.config.timing();
        trace.check_window(&timing.baseline_window)?;

        let normalized = self.normalizer.normalize(trace.data(), accelerator);

        let excluded = trace.non_finite_regions();
        if !excluded.is_empty() {
            info!(
                "Excluding {} of {} regions with no finite samples",
                excluded.len(),
                trace.n_regions()
            );
        }
        let analysed: Vec<usize> = (0..trace.n_regions())
            .filter(|r| excluded.binary_search(r).is_err())
            .collect();

        let window = SearchWindow::from_timing(timing, self.config.detection(), trace.n_frames());
        debug!("Scanning {} regions over {:?}", analysed.len(), window.ranges());

        let regions = map_indices(analysed.len(), |i| {
            let index = analysed[i];
            let column = normalized.column(index).to_vec();
            let (noise, thresholds) = self.calculator.region(&column);
            let detection = self.detector.scan(&column, thresholds, &window);
            RegionSummary {
                index,
                id: trace.region_ids()[index].clone(),
                noise,
                thresholds,
                detection,
            }
        });

        let statistics = FilterStatistics::from_regions(
            trace.n_regions(),
            excluded.len(),
            &regions,
            normalized.accelerated(),
        );

        let retained: Vec<&RegionSummary> = regions.iter().filter(|r| r.detection.passed).collect();
        if retained.is_empty() {
            info!(
                "No region passed the response filter, {} analysed, {} excluded",
                statistics.analysed_regions, statistics.excluded_regions
            );
        }
        let columns: Vec<usize> = retained.iter().map(|r| r.index).collect();
        let result = FilterResult {
            region_ids: retained.iter().map(|r| r.id.clone()).collect(),
            signal: normalized.data.select(Axis(1), &columns),
            thresholds: retained.iter().map(|r| r.thresholds).collect(),
            statistics,
        };

        Ok(ResponseAnalysis {
            normalized,
            regions,
            result,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::accelerator::DeviceError;
    use crate::config::{
        BaselineMethod, ExecutionConfig, NormalizationConfig, RollingMedianConfig, StimulusTiming,
        ThresholdConfig,
    };
    use crate::test_data::{self, EmulatedDevice};
    use rstest::rstest;

    fn timing() -> StimulusTiming {
        StimulusTiming::single(267, 2.0, 0..200)
    }

    fn scenario_a() -> Vec<f32> {
        test_data::step_response(600, 100.0, 268..291, 110.0)
    }

    fn flat() -> Vec<f32> {
        vec![100.0; 600]
    }

    fn chattering() -> Vec<f32> {
        test_data::chattering(600, 267, 25, 10.0)
            .into_iter()
            .map(|v| v + 100.0)
            .collect()
    }

    #[rstest]
    #[case::fixed(BaselineMethod::Fixed)]
    #[case::rolling_median(BaselineMethod::RollingMedian(RollingMedianConfig::default()))]
    fn test_step_response_passes(#[case] method: BaselineMethod) {
        let filter = ResponseFilter::from_builder(
            AnalysisConfig::builder(timing())
                .normalization(NormalizationConfig::default().method(method)),
        )
        .unwrap();
        let trace = test_data::trace_matrix(vec![scenario_a()]);
        let analysis = filter.run(&trace, None).unwrap();

        let signal = analysis.normalized.column(0);
        assert!(signal.iter().take(200).all(|v| v.abs() < 1e-6));
        assert!((signal[268] - 0.1).abs() < 1e-5);

        let region = &analysis.regions[0];
        assert_eq!(region.noise.std, 0.0);
        assert_eq!(region.noise.class, NoiseClass::Low);
        assert!(region.thresholds.lower() < region.thresholds.upper());
        assert!(region.detection.passed);
        assert_eq!(region.detection.crossing_frames, vec![268]);
        assert_eq!(region.detection.valid_durations, vec![23]);
        assert_eq!(region.detection.valid_durations_ms, vec![46.0]);

        assert_eq!(analysis.result.region_ids, vec!["roi_0".to_string()]);
        assert_eq!(analysis.result.signal.dim(), (600, 1));
    }

    #[test_log::test]
    fn test_non_finite_region_excluded() {
        let trace = test_data::trace_matrix(vec![scenario_a(), vec![f32::NAN; 600], scenario_a()]);
        let filter = ResponseFilter::new(AnalysisConfig::builder(timing()).build().unwrap());
        let analysis = filter.run(&trace, None).unwrap();

        assert_eq!(analysis.normalized.dim(), (600, 3));
        assert_eq!(analysis.regions.len(), 2);
        assert!(analysis.regions.iter().all(|r| r.id != "roi_1"));
        let stats = &analysis.result.statistics;
        assert_eq!(stats.total_regions, 3);
        assert_eq!(stats.excluded_regions, 1);
        assert_eq!(stats.analysed_regions, 2);
        assert_eq!(
            analysis.result.region_ids,
            vec!["roi_0".to_string(), "roi_2".to_string()]
        );
    }

    #[test]
    fn test_excessive_crossings_rejected() {
        let trace = test_data::trace_matrix(vec![chattering()]);
        let filter = ResponseFilter::new(AnalysisConfig::builder(timing()).build().unwrap());
        let analysis = filter.run(&trace, None).unwrap();
        let detection = &analysis.regions[0].detection;
        assert_eq!(detection.crossing_frames.len(), 25);
        assert!(detection.excessive_crossings);
        assert_eq!(detection.valid_events, 0);
        assert!(analysis.result.is_empty());
        assert_eq!(analysis.result.statistics.excessive_crossing_regions, 1);
    }

    #[test_log::test]
    fn test_retained_collections_are_aligned() {
        let weak = test_data::step_response(600, 200.0, 270..285, 230.0);
        let trace = test_data::trace_matrix(vec![flat(), scenario_a(), chattering(), weak, flat()]);
        let filter = ResponseFilter::new(AnalysisConfig::builder(timing()).build().unwrap());
        let analysis = filter.run(&trace, None).unwrap();
        let result = &analysis.result;

        assert_eq!(result.region_ids, vec!["roi_1".to_string(), "roi_3".to_string()]);
        assert_eq!(result.signal.ncols(), result.region_ids.len());
        assert_eq!(result.thresholds.len(), result.region_ids.len());
        for (k, id) in result.region_ids.iter().enumerate() {
            let region = analysis.regions.iter().find(|r| &r.id == id).unwrap();
            assert_eq!(result.thresholds[k], region.thresholds);
            assert_eq!(result.signal.column(k), analysis.normalized.column(region.index));
        }

        let stats = &result.statistics;
        assert_eq!(stats.passed_regions, 2);
        assert_eq!(stats.failed_regions, 3);
        assert_eq!(stats.low_noise.total, 5);
        assert_eq!(stats.low_noise.passed, 2);
        assert_eq!(stats.triggered_regions, 3);
        assert!((stats.trigger_rate() - 0.6).abs() < 1e-12);
        assert_eq!(stats.valid_events, 2);
        assert_eq!(stats.validity_rate(), 1.0);
        let summary = stats.summary();
        assert!(summary.starts_with("2 of 5 regions passed"), "{summary}");
        assert!(summary.contains("host execution"));
    }

    #[test_log::test]
    fn test_all_rejected_is_not_an_error() {
        let trace = test_data::trace_matrix(vec![flat(), flat(), chattering()]);
        let filter = ResponseFilter::new(AnalysisConfig::builder(timing()).build().unwrap());
        let analysis = filter.run(&trace, None).unwrap();
        assert!(analysis.result.is_empty());
        assert_eq!(analysis.result.signal.dim(), (600, 0));
        assert!(analysis.result.thresholds.is_empty());
        let stats = &analysis.result.statistics;
        assert_eq!(stats.passed_regions, 0);
        assert_eq!(stats.failed_regions, 3);
        assert_eq!(stats.validity_rate(), 0.0);
    }

    #[test_log::test]
    fn test_accelerated_failure_matches_host() {
        let columns: Vec<Vec<f32>> = (0..40)
            .map(|i| test_data::evoked_response(600, 100.0 + i as f32, 0.5, 267, 0.2, 8.0, i))
            .collect();
        let trace = test_data::trace_matrix(columns);
        let config = AnalysisConfig::builder(timing())
            .execution(
                ExecutionConfig::default()
                    .min_accelerated_size(0)
                    .min_speedup(0.0)
                    .large_dataset_override(0),
            )
            .build()
            .unwrap();
        let filter = ResponseFilter::new(config);
        let host = filter.run(&trace, None).unwrap();
        assert!(!host.result.statistics.accelerated);

        let context = AcceleratorContext::acquire(EmulatedDevice::new(1 << 30)).unwrap();
        let accelerated = filter.run(&trace, Some(&context)).unwrap();
        assert!(accelerated.normalized.execution.plan.use_accelerated);
        assert!(accelerated.result.statistics.accelerated);
        assert_eq!(accelerated.normalized.data, host.normalized.data);
        assert_eq!(accelerated.result.region_ids, host.result.region_ids);

        let failing = AcceleratorContext::acquire(EmulatedDevice::failing_after(1 << 30, 0)).unwrap();
        let recovered = filter.run(&trace, Some(&failing)).unwrap();
        assert!(recovered.normalized.execution.plan.use_accelerated);
        assert!(!recovered.result.statistics.accelerated);
        assert!(matches!(
            recovered.normalized.execution.fallback,
            Some(DeviceError::Failure(_))
        ));
        assert_eq!(recovered.normalized.data, host.normalized.data);
        assert_eq!(recovered.result, host.result);
    }

    #[test]
    fn test_invalid_input() {
        let trace = test_data::trace_matrix(vec![flat()]);
        let filter = ResponseFilter::new(
            AnalysisConfig::builder(StimulusTiming::single(267, 2.0, 0..700))
                .build()
                .unwrap(),
        );
        assert_eq!(
            filter.run(&trace, None).unwrap_err(),
            AnalysisError::InvalidInput(TraceError::BaselineWindowOutOfBounds {
                start: 0,
                end: 700,
                frames: 600
            })
        );
    }

    #[test]
    fn test_invalid_configuration() {
        let builder = AnalysisConfig::builder(timing())
            .thresholds(ThresholdConfig::default().lower_multiplier(2.8));
        assert!(matches!(
            ResponseFilter::from_builder(builder),
            Err(AnalysisError::Configuration(
                ConfigError::LowerMultiplierTooLarge { .. }
            ))
        ));
    }
}
