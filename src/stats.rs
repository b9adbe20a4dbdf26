//! Small descriptive statistics over fluorescence samples.
//!
//! Every reducer here skips non-finite values, so a trace with dropped frames
//! (recorded as `NaN`) still yields a usable summary. A reducer with no finite
//! input returns `None` rather than inventing a value.
use num_traits::{Float, FromPrimitive};

pub fn _isclose<T>(x: T, y: T, rtol: T, atol: T) -> bool
where
    T: Float,
{
    (x - y).abs() <= (atol + rtol * y.abs())
}

pub fn isclose<T>(x: T, y: T) -> bool
where
    T: Float + FromPrimitive,
{
    match (T::from_f64(1e-5), T::from_f64(1e-8)) {
        (Some(rtol), Some(atol)) => _isclose(x, y, rtol, atol),
        _ => x == y,
    }
}

fn finite<T: Float>(values: &[T]) -> impl Iterator<Item = f64> + '_ {
    values
        .iter()
        .filter(|v| v.is_finite())
        .filter_map(|v| v.to_f64())
}

/// The arithmetic mean of the finite values, accumulated in double precision.
pub fn mean<T: Float>(values: &[T]) -> Option<f64> {
    let (total, count) = finite(values).fold((0.0, 0usize), |(t, n), v| (t + v, n + 1));
    if count == 0 {
        None
    } else {
        Some(total / count as f64)
    }
}

/// The standard deviation of the finite values with `ddof` delta degrees of freedom.
///
/// Returns `Some(0.0)` when there are not more than `ddof` finite values.
pub fn std_dev<T: Float>(values: &[T], ddof: usize) -> Option<f64> {
    let mu = mean(values)?;
    let (ss, count) = finite(values).fold((0.0, 0usize), |(acc, n), v| {
        let d = v - mu;
        (acc + d * d, n + 1)
    });
    if count <= ddof {
        return Some(0.0);
    }
    Some((ss / (count - ddof) as f64).sqrt())
}

/// The median of the finite values.
pub fn median<T: Float>(values: &[T]) -> Option<T> {
    let mut sorted: Vec<T> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    median_of_sorted(&sorted)
}

/// The median of a sorted slice of finite values.
pub fn median_of_sorted<T: Float>(sorted: &[T]) -> Option<T> {
    let n = sorted.len();
    if n == 0 {
        None
    } else if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        let two = T::one() + T::one();
        Some((sorted[n / 2 - 1] + sorted[n / 2]) / two)
    }
}

/// The smallest and largest finite values, or `None` if there are none.
pub fn minmax<T: Float>(values: &[T]) -> Option<(T, T)> {
    let mut max = -T::infinity();
    let mut min = T::infinity();
    let mut seen = false;

    for v in values.iter().filter(|v| v.is_finite()) {
        seen = true;
        if *v > max {
            max = *v;
        }
        if *v < min {
            min = *v
        }
    }
    seen.then_some((min, max))
}
