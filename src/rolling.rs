//! Centered rolling-window reductions over a single trace.
//!
//! Windows are centered on each frame and shrink at the trace boundaries instead of
//! wrapping around or padding with zeros. A window of `width` frames covers
//! `width / 2` frames before the center and `(width - 1) / 2` after it, so odd widths
//! are symmetric and even widths lean one frame into the past.
use std::cmp::Ordering;
use std::ops::Range;

use num_traits::Float;

use crate::stats::median_of_sorted;

/// A sorted multiset of the finite values currently inside a sliding window.
#[derive(Debug, Clone, Default)]
struct SortedWindow<F: Float> {
    buffer: Vec<F>,
}

impl<F: Float> SortedWindow<F> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    fn position(&self, value: F) -> usize {
        self.buffer
            .partition_point(|probe| probe.partial_cmp(&value) == Some(Ordering::Less))
    }

    fn insert(&mut self, value: F) {
        if !value.is_finite() {
            return;
        }
        let i = self.position(value);
        self.buffer.insert(i, value);
    }

    fn remove(&mut self, value: F) {
        if !value.is_finite() {
            return;
        }
        let i = self.position(value);
        if i < self.buffer.len() && self.buffer[i] == value {
            self.buffer.remove(i);
        }
    }

    fn median(&self) -> Option<F> {
        median_of_sorted(&self.buffer)
    }
}

/// A centered window of fixed nominal width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingWindow {
    pub width: usize,
}

impl RollingWindow {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
        }
    }

    #[inline]
    fn extents(&self) -> (usize, usize) {
        (self.width / 2, (self.width - 1) / 2)
    }

    /// The frames covered by the window centered on `center` in a trace of `n` frames.
    pub fn bounds(&self, center: usize, n: usize) -> Range<usize> {
        let (before, after) = self.extents();
        let start = center.saturating_sub(before);
        let end = (center + after + 1).min(n);
        start..end
    }

    /// The rolling median of `values`. Non-finite samples are ignored inside each window,
    /// and a window holding no finite sample yields `NaN`.
    pub fn median<F: Float>(&self, values: &[F]) -> Vec<F> {
        let n = values.len();
        let (before, after) = self.extents();
        let mut window = SortedWindow::with_capacity(self.width);
        let mut result = Vec::with_capacity(n);
        let mut next_in = 0;

        for center in 0..n {
            let last = (center + after).min(n - 1);
            while next_in <= last {
                window.insert(values[next_in]);
                next_in += 1;
            }
            if center > before {
                window.remove(values[center - before - 1]);
            }
            result.push(window.median().unwrap_or_else(F::nan));
        }
        result
    }

    /// The rolling sample standard deviation (one delta degree of freedom) of `values`.
    ///
    /// Windows holding fewer than two finite samples yield zero.
    pub fn std_dev<F: Float>(&self, values: &[F]) -> Vec<F> {
        let n = values.len();
        let mut count = Vec::with_capacity(n + 1);
        let mut sum = Vec::with_capacity(n + 1);
        let mut sum_sq = Vec::with_capacity(n + 1);
        count.push(0usize);
        sum.push(0.0f64);
        sum_sq.push(0.0f64);
        for (i, v) in values.iter().enumerate() {
            let (c, s, q) = match v.to_f64().filter(|v| v.is_finite()) {
                Some(v) => (1, v, v * v),
                None => (0, 0.0, 0.0),
            };
            count.push(count[i] + c);
            sum.push(sum[i] + s);
            sum_sq.push(sum_sq[i] + q);
        }

        (0..n)
            .map(|center| {
                let Range { start, end } = self.bounds(center, n);
                let k = count[end] - count[start];
                if k < 2 {
                    return F::zero();
                }
                let s = sum[end] - sum[start];
                let q = sum_sq[end] - sum_sq[start];
                let variance = ((q - s * s / k as f64) / (k - 1) as f64).max(0.0);
                F::from(variance.sqrt()).unwrap_or_else(F::zero)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stats;

    fn naive_median(values: &[f32], window: RollingWindow) -> Vec<f32> {
        (0..values.len())
            .map(|i| {
                let iv = window.bounds(i, values.len());
                stats::median(&values[iv]).unwrap_or(f32::NAN)
            })
            .collect()
    }

    #[test]
    fn test_bounds_shrink_at_edges() {
        let window = RollingWindow::new(5);
        assert_eq!(window.bounds(0, 10), 0..3);
        assert_eq!(window.bounds(1, 10), 0..4);
        assert_eq!(window.bounds(5, 10), 3..8);
        assert_eq!(window.bounds(9, 10), 7..10);

        let even = RollingWindow::new(4);
        assert_eq!(even.bounds(5, 10), 3..7);
    }

    #[test]
    fn test_median_matches_naive() {
        let values: Vec<f32> = (0..97)
            .map(|i| ((i * 37) % 23) as f32 + if i % 11 == 0 { 40.0 } else { 0.0 })
            .collect();
        for width in [1, 2, 3, 4, 7, 10, 31, 200] {
            let window = RollingWindow::new(width);
            assert_eq!(window.median(&values), naive_median(&values, window), "width {width}");
        }
    }

    #[test]
    fn test_median_ignores_nan() {
        let values = [1.0f32, f32::NAN, 3.0, 5.0, f32::NAN];
        let out = RollingWindow::new(3).median(&values);
        assert_eq!(out, vec![1.0, 2.0, 4.0, 4.0, 5.0]);

        let out = RollingWindow::new(1).median(&[f32::NAN, 2.0]);
        assert!(out[0].is_nan());
        assert_eq!(out[1], 2.0);
    }

    #[test]
    fn test_std_dev_matches_naive() {
        let values: Vec<f64> = (0..50).map(|i| ((i * 13) % 7) as f64 - 3.0).collect();
        let window = RollingWindow::new(9);
        let fast = window.std_dev(&values);
        for (i, v) in fast.iter().enumerate() {
            let iv = window.bounds(i, values.len());
            let expected = stats::std_dev(&values[iv], 1).unwrap();
            assert!(stats::isclose(*v, expected), "{i}: {v} != {expected}");
        }
        assert_eq!(RollingWindow::new(1).std_dev(&[3.0f32, 4.0]), vec![0.0, 0.0]);
    }
}
