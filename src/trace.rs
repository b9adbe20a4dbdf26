//! The raw fluorescence input: a frames × regions intensity matrix with one
//! identifier per region column.
use std::collections::HashSet;
use std::ops::Range;

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

/// The fewest frames a recording may have to be analysed
pub const MIN_FRAMES: usize = 300;

/// All the ways an input trace can be malformed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    #[error("The trace matrix has no regions or no frames")]
    Empty,
    #[error("The trace matrix has {frames} frames, at least {minimum} are required")]
    TooFewFrames { frames: usize, minimum: usize },
    #[error("The trace matrix has {columns} columns but {identifiers} region identifiers were supplied")]
    IdentifierCountMismatch { columns: usize, identifiers: usize },
    #[error("The region identifier {0:?} appears more than once")]
    DuplicateIdentifier(String),
    #[error("The region columns have different lengths")]
    RaggedColumns,
    #[error("The trace matrix holds no finite intensity values")]
    NoFiniteValues,
    #[error("The baseline window {start}..{end} does not fit inside {frames} frames")]
    BaselineWindowOutOfBounds {
        start: usize,
        end: usize,
        frames: usize,
    },
}

/// A frames × regions matrix of raw intensities and the identifier of each region.
///
/// Identifiers are unique and positionally aligned with the columns, which is the
/// only link between a column and the region it came from.
#[derive(Debug, Clone)]
pub struct TraceMatrix {
    data: Array2<f32>,
    region_ids: Vec<String>,
}

impl TraceMatrix {
    /// Wrap `data` (frames along axis 0, regions along axis 1) after checking it
    pub fn new(data: Array2<f32>, region_ids: Vec<String>) -> Result<Self, TraceError> {
        let (frames, regions) = data.dim();
        if frames == 0 || regions == 0 {
            return Err(TraceError::Empty);
        }
        if frames < MIN_FRAMES {
            return Err(TraceError::TooFewFrames {
                frames,
                minimum: MIN_FRAMES,
            });
        }
        if region_ids.len() != regions {
            return Err(TraceError::IdentifierCountMismatch {
                columns: regions,
                identifiers: region_ids.len(),
            });
        }
        let mut seen = HashSet::with_capacity(regions);
        for id in region_ids.iter() {
            if !seen.insert(id.as_str()) {
                return Err(TraceError::DuplicateIdentifier(id.clone()));
            }
        }
        if !data.iter().any(|v| v.is_finite()) {
            return Err(TraceError::NoFiniteValues);
        }
        Ok(Self { data, region_ids })
    }

    /// Build a matrix from `(identifier, samples)` pairs, one per region
    pub fn from_columns<S: Into<String>>(
        columns: impl IntoIterator<Item = (S, Vec<f32>)>,
    ) -> Result<Self, TraceError> {
        let mut region_ids = Vec::new();
        let mut samples = Vec::new();
        for (id, column) in columns {
            region_ids.push(id.into());
            samples.push(column);
        }
        let frames = samples.first().map(|c| c.len()).unwrap_or(0);
        if samples.iter().any(|c| c.len() != frames) {
            return Err(TraceError::RaggedColumns);
        }
        let data = Array2::from_shape_fn((frames, samples.len()), |(t, r)| samples[r][t]);
        Self::new(data, region_ids)
    }

    pub fn n_frames(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_regions(&self) -> usize {
        self.data.ncols()
    }

    /// The number of stored samples, frames × regions
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    pub fn column(&self, region: usize) -> ArrayView1<'_, f32> {
        self.data.column(region)
    }

    pub fn region_ids(&self) -> &[String] {
        &self.region_ids
    }

    /// Indices of regions in which no sample is finite
    pub fn non_finite_regions(&self) -> Vec<usize> {
        self.data
            .axis_iter(Axis(1))
            .enumerate()
            .filter(|(_, column)| !column.iter().any(|v| v.is_finite()))
            .map(|(i, _)| i)
            .collect()
    }

    /// Check that `window` lies inside the recording
    pub fn check_window(&self, window: &Range<usize>) -> Result<(), TraceError> {
        let frames = self.n_frames();
        if window.start >= window.end || window.end > frames {
            Err(TraceError::BaselineWindowOutOfBounds {
                start: window.start,
                end: window.end,
                frames,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("roi_{i}")).collect()
    }

    #[test]
    fn test_validates_shape() {
        let err = TraceMatrix::new(Array2::zeros((0, 3)), ids(3)).unwrap_err();
        assert_eq!(err, TraceError::Empty);

        let err = TraceMatrix::new(Array2::ones((299, 2)), ids(2)).unwrap_err();
        assert_eq!(
            err,
            TraceError::TooFewFrames {
                frames: 299,
                minimum: MIN_FRAMES
            }
        );

        let err = TraceMatrix::new(Array2::ones((300, 2)), ids(3)).unwrap_err();
        assert_eq!(
            err,
            TraceError::IdentifierCountMismatch {
                columns: 2,
                identifiers: 3
            }
        );

        let err = TraceMatrix::new(
            Array2::ones((300, 2)),
            vec!["a".to_string(), "a".to_string()],
        )
        .unwrap_err();
        assert_eq!(err, TraceError::DuplicateIdentifier("a".to_string()));

        let err = TraceMatrix::new(Array2::from_elem((300, 2), f32::NAN), ids(2)).unwrap_err();
        assert_eq!(err, TraceError::NoFiniteValues);
    }

    #[test]
    fn test_from_columns() {
        let trace = TraceMatrix::from_columns([
            ("a", vec![1.0; 300]),
            ("b", vec![f32::NAN; 300]),
            ("c", vec![2.0; 300]),
        ])
        .unwrap();
        assert_eq!(trace.n_frames(), 300);
        assert_eq!(trace.n_regions(), 3);
        assert_eq!(trace.len(), 900);
        assert_eq!(trace.column(2)[10], 2.0);
        assert_eq!(trace.non_finite_regions(), vec![1]);

        let err = TraceMatrix::from_columns([("a", vec![1.0; 300]), ("b", vec![1.0; 301])])
            .unwrap_err();
        assert_eq!(err, TraceError::RaggedColumns);
    }

    #[test]
    fn test_check_window() {
        let trace = TraceMatrix::new(Array2::ones((300, 1)), ids(1)).unwrap();
        assert!(trace.check_window(&(0..200)).is_ok());
        assert!(trace.check_window(&(100..301)).is_err());
    }
}
