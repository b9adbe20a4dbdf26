//! A two-threshold (Schmitt-trigger) detector for stimulus-evoked responses.
//!
//! Within a post-stimulus search window the trigger is armed when the signal rises
//! above the upper threshold, and the armed candidate resolves when the signal drops
//! below the lower threshold, or is held as a sustained event if that does not happen
//! within the decay horizon. Candidates are then checked against amplitude, duration
//! and decay-shape criteria from [`DetectionConfig`].
//!
//! ```text
//!           upper ─ ─ ─ ─ ─╱‾‾‾‾╲─ ─ ─ ─ ─ ─ ─ ─
//!                         ╱      ╲__
//!           lower ─ ─ ─ ─╱─ ─ ─ ─ ─ ╲─ ─ ─ ─ ─ ─
//!                 ______╱            ╲_________
//!                       f   (armed)   d
//! ```
use std::fmt;
use std::ops::Range;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::{DetectionConfig, Stimulus, StimulusTiming};
use crate::stats;
use crate::threshold::ThresholdPair;

/// The frames scanned for a response, as sorted, disjoint ranges clipped to the trace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchWindow {
    ranges: Vec<Range<usize>>,
}

impl SearchWindow {
    /// Build a window from arbitrary ranges, clipping them to `n_frames` and merging
    /// any that overlap or touch
    pub fn from_ranges(ranges: impl IntoIterator<Item = Range<usize>>, n_frames: usize) -> Self {
        let mut clipped: Vec<Range<usize>> = ranges
            .into_iter()
            .map(|r| r.start.min(n_frames)..r.end.min(n_frames))
            .filter(|r| r.start < r.end)
            .collect();
        clipped.sort_by_key(|r| r.start);

        let mut merged: Vec<Range<usize>> = Vec::with_capacity(clipped.len());
        for range in clipped {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        Self { ranges: merged }
    }

    /// `length` frames starting at the stimulus `onset`
    pub fn single(onset: usize, length: usize, n_frames: usize) -> Self {
        Self::from_ranges([onset..onset.saturating_add(length)], n_frames)
    }

    /// The union of the windows following each stimulus of a paired-pulse protocol
    pub fn paired(
        first: (usize, usize),
        second: (usize, usize),
        n_frames: usize,
    ) -> Self {
        Self::from_ranges(
            [
                first.0..first.0.saturating_add(first.1),
                second.0..second.0.saturating_add(second.1),
            ],
            n_frames,
        )
    }

    /// The window implied by the experiment timing and detection settings
    pub fn from_timing(
        timing: &StimulusTiming,
        detection: &DetectionConfig,
        n_frames: usize,
    ) -> Self {
        match timing.stimulus {
            Stimulus::Single { frame } => {
                Self::single(frame, detection.single_window_frames, n_frames)
            }
            Stimulus::Paired { first, second } => {
                let (first_len, second_len) = detection.paired_window_frames;
                Self::paired((first, first_len), (second, second_len), n_frames)
            }
        }
    }

    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The number of frames covered
    pub fn len(&self) -> usize {
        self.ranges.iter().map(|r| r.len()).sum()
    }

    pub fn contains(&self, frame: usize) -> bool {
        self.ranges.iter().any(|r| r.contains(&frame))
    }

    /// Every covered frame in ascending order
    pub fn frames(&self) -> impl Iterator<Item = usize> + '_ {
        self.ranges.iter().flat_map(|r| r.clone())
    }
}

/// Why a candidate event was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RejectReason {
    /// The event did not last longer than the minimum duration
    TooShort,
    /// The event never reached the required peak amplitude
    PeakTooLow,
    /// The second half of the event was too large relative to the first
    NoDecay,
    /// The event's amplitude varied too much relative to its mean
    TooNoisy,
}

/// How a candidate event resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EventOutcome {
    /// The event decayed and passed every check
    Valid,
    /// The signal stayed above the lower threshold for the whole decay horizon
    Sustained,
    Rejected(RejectReason),
}

impl EventOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, EventOutcome::Valid | EventOutcome::Sustained)
    }
}

/// One candidate event found by the trigger
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SignalEvent {
    /// The frame at which the signal rose above the upper threshold
    pub start_frame: usize,
    /// The frame at which the event resolved: the first frame below the lower
    /// threshold, or the end of the decay horizon for a sustained event
    pub end_frame: usize,
    /// The largest value over the event
    pub peak_amplitude: f32,
    /// The event length in frames
    pub duration: usize,
    pub outcome: EventOutcome,
}

impl SignalEvent {
    pub fn valid(&self) -> bool {
        self.outcome.is_valid()
    }
}

impl fmt::Display for SignalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{} ({} frames, peak {:.4}): {:?}",
            self.start_frame, self.end_frame, self.duration, self.peak_amplitude, self.outcome
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TriggerState {
    Idle,
    Armed { onset: usize },
    Done,
}

/// Frames in `window` at which `trace` rises above `upper`.
///
/// The first frame of each window range counts as a crossing if it is already above.
pub fn upper_crossings(trace: &[f32], upper: f32, window: &SearchWindow) -> Vec<usize> {
    let mut crossings = Vec::new();
    for range in window.ranges() {
        let mut above = false;
        for f in range.clone() {
            let now = trace[f] > upper;
            if now && !above {
                crossings.push(f);
            }
            above = now;
        }
    }
    crossings
}

/// Walks one region's search window, yielding each candidate event in frame order.
///
/// After an event resolves, scanning resumes at the first frame following the
/// resolution frame.
#[derive(Debug, Clone)]
pub struct EventScanner<'a> {
    trace: &'a [f32],
    thresholds: ThresholdPair,
    params: &'a DetectionConfig,
    window: &'a SearchWindow,
    cursor: usize,
    state: TriggerState,
}

impl<'a> EventScanner<'a> {
    pub fn new(
        trace: &'a [f32],
        thresholds: ThresholdPair,
        params: &'a DetectionConfig,
        window: &'a SearchWindow,
    ) -> Self {
        Self {
            trace,
            thresholds,
            params,
            window,
            cursor: 0,
            state: TriggerState::Idle,
        }
    }

    fn next_onset(&self) -> Option<usize> {
        let upper = self.thresholds.upper();
        self.window
            .frames()
            .skip_while(|f| *f < self.cursor)
            .find(|f| self.trace.get(*f).is_some_and(|v| *v > upper))
    }

    fn resolve(&self, onset: usize) -> SignalEvent {
        let trace = self.trace;
        let horizon = self.params.decay_horizon;
        let last = onset.saturating_add(horizon).min(trace.len() - 1);
        let lower = self.thresholds.lower();

        match (onset + 1..=last).find(|d| trace[*d] < lower) {
            None => {
                let peak = stats::minmax(&trace[onset..=last])
                    .map(|(_, max)| max)
                    .unwrap_or(trace[onset]);
                SignalEvent {
                    start_frame: onset,
                    end_frame: last,
                    peak_amplitude: peak,
                    duration: horizon,
                    outcome: EventOutcome::Sustained,
                }
            }
            Some(decay) => {
                let samples = &trace[onset..decay];
                let peak = stats::minmax(samples)
                    .map(|(_, max)| max)
                    .unwrap_or(trace[onset]);
                let duration = decay - onset;
                SignalEvent {
                    start_frame: onset,
                    end_frame: decay,
                    peak_amplitude: peak,
                    duration,
                    outcome: self.validate(samples, peak),
                }
            }
        }
    }

    /// Apply the validation policy to the samples of a decayed candidate
    fn validate(&self, samples: &[f32], peak: f32) -> EventOutcome {
        let params = self.params;
        let duration = samples.len();

        if duration <= params.min_duration {
            return EventOutcome::Rejected(RejectReason::TooShort);
        }
        if peak < self.thresholds.upper() * params.peak_amplitude_factor {
            return EventOutcome::Rejected(RejectReason::PeakTooLow);
        }
        if duration <= params.short_signal_cutoff {
            return EventOutcome::Valid;
        }

        let (first, second) = samples.split_at(duration.div_ceil(2));
        if let (Some(first), Some(second)) = (stats::mean(first), stats::mean(second)) {
            if first > 0.0 && second / first > params.max_decay_ratio as f64 {
                return EventOutcome::Rejected(RejectReason::NoDecay);
            }
        }

        match (stats::mean(samples), stats::std_dev(samples, 0)) {
            (Some(mean), Some(std)) if mean > 0.0 => {
                if std / mean > params.max_noise_ratio as f64 {
                    EventOutcome::Rejected(RejectReason::TooNoisy)
                } else {
                    EventOutcome::Valid
                }
            }
            _ => EventOutcome::Rejected(RejectReason::TooNoisy),
        }
    }
}

impl Iterator for EventScanner<'_> {
    type Item = SignalEvent;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.state {
                TriggerState::Done => return None,
                TriggerState::Idle => match self.next_onset() {
                    Some(onset) => self.state = TriggerState::Armed { onset },
                    None => {
                        self.state = TriggerState::Done;
                        return None;
                    }
                },
                TriggerState::Armed { onset } => {
                    let event = self.resolve(onset);
                    self.cursor = event.end_frame + 1;
                    self.state = TriggerState::Idle;
                    return Some(event);
                }
            }
        }
    }
}

/// The detection summary of one region
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegionDetection {
    /// Whether at least one event was valid or sustained
    pub passed: bool,
    pub valid_events: usize,
    pub invalid_events: usize,
    /// Valid events that never decayed within the horizon, a subset of `valid_events`
    pub sustained_events: usize,
    pub valid_durations: Vec<usize>,
    pub valid_durations_ms: Vec<f64>,
    /// The largest peak among the valid events
    pub peak_amplitude: Option<f32>,
    /// Every upper-threshold crossing in the search window, for diagnostics
    pub crossing_frames: Vec<usize>,
    /// Set when the region was discarded as noise for crossing too often
    pub excessive_crossings: bool,
    /// Set when the search window held no frames
    pub empty_window: bool,
}

impl RegionDetection {
    pub fn total_events(&self) -> usize {
        self.valid_events + self.invalid_events
    }

    pub fn triggered(&self) -> bool {
        !self.crossing_frames.is_empty()
    }
}

/// Scans normalized regions for validated responses
#[derive(Debug, Clone)]
pub struct SignalDetector {
    params: DetectionConfig,
    frame_interval_ms: f64,
}

impl SignalDetector {
    pub fn new(params: DetectionConfig, frame_interval_ms: f64) -> Self {
        Self {
            params,
            frame_interval_ms,
        }
    }

    pub fn params(&self) -> &DetectionConfig {
        &self.params
    }

    /// Iterate over the candidate events of `trace` without any short-circuiting
    pub fn events<'a>(
        &'a self,
        trace: &'a [f32],
        thresholds: ThresholdPair,
        window: &'a SearchWindow,
    ) -> EventScanner<'a> {
        EventScanner::new(trace, thresholds, &self.params, window)
    }

    /// Classify one region as a response or noise
    pub fn scan(
        &self,
        trace: &[f32],
        thresholds: ThresholdPair,
        window: &SearchWindow,
    ) -> RegionDetection {
        let window = SearchWindow::from_ranges(window.ranges().iter().cloned(), trace.len());
        if window.is_empty() {
            return RegionDetection {
                empty_window: true,
                ..Default::default()
            };
        }

        let crossing_frames = upper_crossings(trace, thresholds.upper(), &window);
        if crossing_frames.len() > self.params.max_crossings {
            return RegionDetection {
                crossing_frames,
                excessive_crossings: true,
                ..Default::default()
            };
        }

        let mut detection = RegionDetection {
            crossing_frames,
            ..Default::default()
        };
        for event in self.events(trace, thresholds, &window) {
            if event.valid() {
                detection.valid_events += 1;
                if event.outcome == EventOutcome::Sustained {
                    detection.sustained_events += 1;
                }
                detection.valid_durations.push(event.duration);
                detection
                    .valid_durations_ms
                    .push(event.duration as f64 * self.frame_interval_ms);
                detection.peak_amplitude = Some(match detection.peak_amplitude {
                    Some(peak) => peak.max(event.peak_amplitude),
                    None => event.peak_amplitude,
                });
            } else {
                detection.invalid_events += 1;
            }
        }
        detection.passed = detection.valid_events > 0;
        detection
    }
}
