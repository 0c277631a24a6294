//! Trial-window segmentation of continuous streams
//!
//! Given a stream's sorted timestamp vector and a trial window, finds the
//! contiguous index range of samples inside the window with two binary
//! searches and slices the value matrix along its time axis. Both window
//! bounds are inclusive.

use ndarray::{s, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Inclusive time window [start, stop] in the stream's time base
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialWindow {
    pub start: f64,
    pub stop: f64,
}

impl TrialWindow {
    pub fn new(start: f64, stop: f64) -> Self {
        Self { start, stop }
    }

    pub fn contains(&self, t: f64) -> bool {
        self.start <= t && t <= self.stop
    }
}

/// Sub-array of a stream restricted to one window
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Index range [start, end) into the parent stream
    pub range: Range<usize>,
    pub timestamps: Vec<f64>,
    /// Shape: [num_channels, range.len()]
    pub values: Array2<f64>,
}

impl Segment {
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }
}

/// Index range `{i : start <= timestamps[i] <= stop}` of a sorted timestamp vector.
///
/// Runs in O(log n). An inverted or non-intersecting window yields an empty
/// range positioned where the window would begin.
pub fn window_range(timestamps: &[f64], window: TrialWindow) -> Range<usize> {
    let lo = timestamps.partition_point(|&t| t < window.start);
    let hi = timestamps.partition_point(|&t| t <= window.stop);
    lo..hi.max(lo)
}

/// Slice `values` (channel × time) to the samples whose timestamp lies in `window`.
///
/// `values` must have one column per timestamp. Rebasing between session-relative
/// and trial-relative clocks is the caller's responsibility.
pub fn segment(values: ArrayView2<'_, f64>, timestamps: &[f64], window: TrialWindow) -> Segment {
    debug_assert_eq!(values.len_of(Axis(1)), timestamps.len());
    let range = window_range(timestamps, window);
    let sliced = values.slice(s![.., range.clone()]).to_owned();

    Segment {
        timestamps: timestamps[range.clone()].to_vec(),
        values: sliced,
        range,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};
    use pretty_assertions::assert_eq;

    fn stream() -> (Vec<f64>, Array2<f64>) {
        (
            vec![0.1, 0.5, 1.2, 1.9, 2.4],
            array![[10.0, 11.0, 12.0, 13.0, 14.0]],
        )
    }

    #[test]
    fn test_segment_inclusive_window() {
        let (timestamps, values) = stream();
        let seg = segment(values.view(), &timestamps, TrialWindow::new(0.4, 1.9));

        assert_eq!(seg.range, 1..4);
        assert_eq!(seg.timestamps, vec![0.5, 1.2, 1.9]);
        assert_eq!(seg.values, array![[11.0, 12.0, 13.0]]);
    }

    #[test]
    fn test_segment_empty_intersection() {
        let (timestamps, values) = stream();

        let before = segment(values.view(), &timestamps, TrialWindow::new(-2.0, 0.0));
        assert!(before.is_empty());
        assert_eq!(before.values.shape(), &[1, 0]);

        let between = segment(values.view(), &timestamps, TrialWindow::new(0.6, 1.1));
        assert!(between.is_empty());
        assert_eq!(between.range, 2..2);

        let after = segment(values.view(), &timestamps, TrialWindow::new(3.0, 4.0));
        assert!(after.is_empty());
    }

    #[test]
    fn test_segment_inverted_window_is_empty() {
        let (timestamps, values) = stream();
        let seg = segment(values.view(), &timestamps, TrialWindow::new(1.9, 0.4));
        assert!(seg.is_empty());
    }

    #[test]
    fn test_segment_preserves_channels() {
        let timestamps = vec![0.0, 1.0, 2.0, 3.0];
        let values = array![[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0], [9.0, 10.0, 11.0, 12.0]];
        let seg = segment(values.view(), &timestamps, TrialWindow::new(1.0, 2.0));
        assert_eq!(seg.values, array![[2.0, 3.0], [6.0, 7.0], [10.0, 11.0]]);
    }

    #[test]
    fn test_segment_repeated_timestamps_at_bounds() {
        let timestamps = vec![0.0, 1.0, 1.0, 1.0, 2.0, 2.0, 3.0];
        let values = Array2::from_shape_vec((1, 7), (0..7).map(f64::from).collect()).unwrap();
        let seg = segment(values.view(), &timestamps, TrialWindow::new(1.0, 2.0));
        assert_eq!(seg.range, 1..6);
    }

    #[test]
    fn test_segments_stay_within_windows_and_form_subsequence() {
        let timestamps: Vec<f64> = (0..1000).map(|i| i as f64 * 0.01).collect();
        let values =
            Array2::from_shape_vec((1, 1000), (0..1000).map(f64::from).collect()).unwrap();
        let windows = vec![
            TrialWindow::new(0.5, 1.5),
            TrialWindow::new(1.5, 3.25),
            TrialWindow::new(4.0, 4.0),
            TrialWindow::new(9.5, 12.0),
        ];

        let segments: Vec<Segment> = windows
            .iter()
            .map(|window| segment(values.view(), &timestamps, *window))
            .collect();
        let mut last_end = 0;
        for (seg, window) in segments.iter().zip(&windows) {
            assert!(seg.timestamps.iter().all(|&t| window.contains(t)));
            assert_eq!(seg.timestamps.len(), seg.values.ncols());
            for (offset, idx) in seg.range.clone().enumerate() {
                assert_eq!(seg.values[[0, offset]], idx as f64);
            }
            // touching windows may share a boundary sample
            assert!(seg.range.start + 1 >= last_end);
            last_end = seg.range.end;
        }
        assert_eq!(segments[3].range.end, 1000);
    }
}
