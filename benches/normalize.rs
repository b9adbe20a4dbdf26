use criterion::{black_box, Criterion};
use ndarray::Array2;

use glusignal::config::{NormalizationConfig, RollingMedianConfig};
use glusignal::detector::{SearchWindow, SignalDetector};
use glusignal::normalize::{compute_fixed_baseline, compute_rolling_median_baseline};
use glusignal::threshold::ThresholdCalculator;
use glusignal::{
    AnalysisConfig, BaselineNormalizer, DetectionConfig, ExecutionDispatcher, ResponseFilter,
    StimulusTiming, ThresholdConfig, TraceMatrix,
};

const FRAMES: usize = 600;
const REGIONS: usize = 256;
const ONSET: usize = 267;

/// Deterministic pseudo-noise so the benchmark inputs never change between runs
fn jitter(t: usize, r: usize) -> f32 {
    let x = (t as u64 * 2654435761 + r as u64 * 40503) % 1000;
    (x as f32 / 1000.0 - 0.5) * 2.0
}

fn synthetic_trace() -> Array2<f32> {
    Array2::from_shape_fn((FRAMES, REGIONS), |(t, r)| {
        let f0 = 100.0 + r as f32;
        let response = if r % 3 == 0 && t >= ONSET {
            0.2 * (-((t - ONSET) as f32) / 8.0).exp()
        } else {
            0.0
        };
        f0 * (1.0 + response) + jitter(t, r)
    })
}

fn normalization(c: &mut Criterion) {
    let _ = pretty_env_logger::try_init();
    let trace = synthetic_trace();

    c.bench_function("fixed_baseline", |b| {
        b.iter(|| black_box(compute_fixed_baseline(trace.view(), &(0..200), 1.0)))
    });

    let params = RollingMedianConfig::default();
    c.bench_function("rolling_median_baseline", |b| {
        b.iter(|| black_box(compute_rolling_median_baseline(trace.view(), &params, 1.0)))
    });
}

fn detection(c: &mut Criterion) {
    let trace = synthetic_trace();
    let normalizer = BaselineNormalizer::new(
        0..200,
        NormalizationConfig::default(),
        ExecutionDispatcher::default(),
    );
    let signal = normalizer.normalize(trace.view(), None);
    let calculator = ThresholdCalculator::new(ThresholdConfig::default(), 0..200);
    let detector = SignalDetector::new(DetectionConfig::default(), 2.0);
    let window = SearchWindow::single(ONSET, 50, FRAMES);
    let columns: Vec<Vec<f32>> = signal.data.columns().into_iter().map(|c| c.to_vec()).collect();

    c.bench_function("threshold_and_scan", |b| {
        b.iter(|| {
            let passed = columns
                .iter()
                .filter(|column| {
                    let (_, thresholds) = calculator.region(column);
                    detector.scan(column, thresholds, &window).passed
                })
                .count();
            black_box(passed)
        })
    });

    let ids: Vec<String> = (0..REGIONS).map(|i| format!("roi_{i}")).collect();
    let matrix = TraceMatrix::new(trace, ids).unwrap();
    let filter = ResponseFilter::new(
        AnalysisConfig::builder(StimulusTiming::single(ONSET, 2.0, 0..200))
            .build()
            .unwrap(),
    );
    c.bench_function("response_filter", |b| {
        b.iter(|| black_box(filter.run(&matrix, None).unwrap()))
    });
}

criterion::criterion_group!(benches, normalization, detection);
criterion::criterion_main!(benches);
