use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

#[cfg(feature = "parallelism")]
use rayon::prelude::*;

// Can't inline cfg-if
cfg_if::cfg_if! {
    if #[cfg(feature = "parallelism")] {
        /// Evaluate `f` for every index in `0..n`, preserving index order in the output.
        pub(crate) fn map_indices<T, F>(n: usize, f: F) -> Vec<T>
        where
            T: Send,
            F: Fn(usize) -> T + Sync + Send,
        {
            (0..n).into_par_iter().map(f).collect()
        }
    } else {
        /// Evaluate `f` for every index in `0..n`, preserving index order in the output.
        pub(crate) fn map_indices<T, F>(n: usize, f: F) -> Vec<T>
        where
            T: Send,
            F: Fn(usize) -> T + Sync + Send,
        {
            (0..n).map(f).collect()
        }
    }
}

/// Apply `f` to every column of `batch`, writing the results back in column order.
///
/// `f` must return exactly one value per frame.
pub(crate) fn map_columns<F>(batch: ArrayView2<'_, f32>, f: F) -> Array2<f32>
where
    F: Fn(ArrayView1<'_, f32>) -> Vec<f32> + Sync + Send,
{
    let (frames, regions) = batch.dim();
    let columns = map_indices(regions, |r| f(batch.column(r)));
    let mut out = Array2::zeros((frames, regions));
    for (mut dest, column) in out.axis_iter_mut(Axis(1)).zip(columns) {
        dest.assign(&ArrayView1::from(column.as_slice()));
    }
    out
}
