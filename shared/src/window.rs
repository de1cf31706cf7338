/*!
Sliding-window distance statistics.

Laser frames are reduced to the smallest average over `window` adjacent
spots. Zero readings mean "no return" and can be treated as very far away.
The per-frame minimum feeds [`ProximityDetector`], which raises a warning
when most of the recent frames are too close and clears it only after a
streak of clearly safe frames.
*/

use crate::protocol::INVALID_DISTANCE;
use serde::{Deserialize, Serialize};
use std::ops::Range;

fn reading(d: u16, ignore_zero: bool) -> u64 {
    if ignore_zero && d == 0 {
        INVALID_DISTANCE as u64
    } else {
        d as u64
    }
}

/// Smallest average over all windows of `window` adjacent spots.
///
/// Returns `None` when the frame has fewer spots than the window.
pub fn min_moving_average(distances: &[u16], window: usize, ignore_zero: bool) -> Option<f64> {
    if window == 0 || distances.len() < window {
        return None;
    }

    let mut sum: u64 = distances[..window].iter().map(|&d| reading(d, ignore_zero)).sum();
    let mut best = sum;
    for i in 1..=distances.len() - window {
        sum = sum + reading(distances[i + window - 1], ignore_zero) - reading(distances[i - 1], ignore_zero);
        best = best.min(sum);
    }

    Some(best as f64 / window as f64)
}

/// Location and sum of the best window found by [`min_window_in_roi`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowHit {
    /// Index of the first spot in the window
    pub start: usize,
    /// Sum of the readings inside the window
    pub sum: u64,
}

impl WindowHit {
    /// Average reading inside the window
    pub fn average(&self, window: usize) -> f64 {
        self.sum as f64 / window as f64
    }
}

/// Best window restricted to a region of interest, sampling every `stride` spots.
///
/// The ROI is clamped to the frame. The first window with the smallest sum wins.
pub fn min_window_in_roi(
    distances: &[u16],
    window: usize,
    roi: Range<usize>,
    stride: usize,
    ignore_zero: bool,
) -> Option<WindowHit> {
    let window = window.max(1);
    let stride = stride.max(1);
    let start = roi.start.min(distances.len());
    let end = roi.end.min(distances.len());
    if end < start + window {
        return None;
    }

    let mut best: Option<WindowHit> = None;
    let mut i = start;
    while i + window <= end {
        let sum: u64 = distances[i..i + window].iter().map(|&d| reading(d, ignore_zero)).sum();
        if best.map_or(true, |b| sum < b.sum) {
            best = Some(WindowHit { start: i, sum });
        }
        i += stride;
    }
    best
}

/// Thresholds for the proximity warning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WarningParams {
    /// Adjacent spots averaged per window
    pub window: usize,
    /// Frames kept in the ring buffer
    pub frames: usize,
    /// A frame minimum below this counts as too close (mm)
    pub dist_thresh: f64,
    /// Too-close frames required in a full ring to raise the warning
    pub required_count: usize,
    /// A frame minimum above this counts towards clearing (mm)
    pub clear_thresh: f64,
    /// Consecutive clear frames needed to drop the warning
    pub clear_frames: usize,
}

impl Default for WarningParams {
    fn default() -> Self {
        Self {
            window: 10,
            frames: 10,
            dist_thresh: 450.0,
            required_count: 7,
            clear_thresh: 500.0,
            clear_frames: 3,
        }
    }
}

/// Change of the warning flag caused by one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WarningTransition {
    /// Warning raised; `below` frames of the ring were under the threshold
    Raised { below: usize, current: f64 },
    /// Warning cleared after the required streak
    Cleared { current: f64 },
}

/// Hysteretic "too close" detector over the last N frame minimums
#[derive(Debug, Clone)]
pub struct ProximityDetector {
    params: WarningParams,
    ring: Vec<f64>,
    pos: usize,
    filled: usize,
    active: bool,
    clear_streak: usize,
}

impl ProximityDetector {
    /// Create a detector with an empty ring
    pub fn new(params: WarningParams) -> Self {
        let frames = params.frames.max(1);
        Self {
            params,
            ring: vec![0.0; frames],
            pos: 0,
            filled: 0,
            active: false,
            clear_streak: 0,
        }
    }

    /// Whether the warning is currently raised
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Parameters in use
    pub fn params(&self) -> &WarningParams {
        &self.params
    }

    /// Reduce a frame to its minimum moving average and push it.
    ///
    /// Frames shorter than the window are ignored.
    pub fn observe(&mut self, distances: &[u16]) -> Option<WarningTransition> {
        let frame_min = min_moving_average(distances, self.params.window, true)?;
        self.push(frame_min)
    }

    /// Push one frame minimum and evaluate the warning state
    pub fn push(&mut self, frame_min: f64) -> Option<WarningTransition> {
        let len = self.ring.len();
        self.ring[self.pos] = frame_min;
        self.pos = (self.pos + 1) % len;
        if self.filled < len {
            self.filled += 1;
        }
        if self.filled < len {
            return None;
        }

        let below = self.ring.iter().filter(|&&v| v < self.params.dist_thresh).count();
        if !self.active {
            if below >= self.params.required_count {
                self.active = true;
                self.clear_streak = 0;
                return Some(WarningTransition::Raised { below, current: frame_min });
            }
            return None;
        }

        if frame_min > self.params.clear_thresh {
            self.clear_streak += 1;
            if self.clear_streak >= self.params.clear_frames {
                self.active = false;
                self.clear_streak = 0;
                return Some(WarningTransition::Cleared { current: frame_min });
            }
        } else {
            self.clear_streak = 0;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_force_min_avg(d: &[u16], w: usize) -> f64 {
        d.windows(w)
            .map(|win| win.iter().map(|&x| x as f64).sum::<f64>() / w as f64)
            .fold(f64::INFINITY, f64::min)
    }

    #[test]
    fn test_min_moving_average_example() {
        let d = [100u16, 100, 100, 500, 500];
        assert_eq!(min_moving_average(&d, 3, false), Some(100.0));
        assert_eq!(min_moving_average(&d, 3, false), Some(brute_force_min_avg(&d, 3)));
    }

    #[test]
    fn test_min_moving_average_matches_brute_force() {
        let d = [812u16, 640, 655, 901, 330, 329, 1200, 77, 450, 451, 452, 3000];
        for w in 1..=d.len() {
            assert_eq!(min_moving_average(&d, w, false), Some(brute_force_min_avg(&d, w)), "window {}", w);
        }
        assert_eq!(min_moving_average(&d, d.len() + 1, false), None);
        assert_eq!(min_moving_average(&d, 0, false), None);
    }

    #[test]
    fn test_zero_readings_are_treated_as_far() {
        let d = [0u16, 0, 700, 710, 720];
        assert_eq!(min_moving_average(&d, 2, true), Some(705.0));
        assert_eq!(min_moving_average(&d, 2, false), Some(0.0));
    }

    #[test]
    fn test_min_window_in_roi() {
        let d = [50u16, 900, 800, 300, 310, 320, 900, 10, 10];
        let hit = min_window_in_roi(&d, 3, 1..7, 1, true).unwrap();
        assert_eq!(hit, WindowHit { start: 3, sum: 930 });
        assert_eq!(hit.average(3), 310.0);

        // Stride 2 from index 1 visits 1, 3 only
        let hit = min_window_in_roi(&d, 3, 1..7, 2, true).unwrap();
        assert_eq!(hit.start, 3);

        assert!(min_window_in_roi(&d, 3, 5..7, 1, true).is_none());
        // ROI past the end is clamped
        assert_eq!(min_window_in_roi(&d, 2, 6..100, 1, true).unwrap().start, 7);
    }

    #[test]
    fn test_warning_raised_once_on_close_frames() {
        let mut det = ProximityDetector::new(WarningParams::default());
        let mut raised = 0;
        for _ in 0..10 {
            if let Some(WarningTransition::Raised { below, .. }) = det.push(400.0) {
                assert_eq!(below, 10);
                raised += 1;
            }
        }
        assert_eq!(raised, 1);
        assert!(det.is_active());

        // Further close frames do not re-raise
        assert_eq!(det.push(400.0), None);
    }

    #[test]
    fn test_warning_waits_for_full_ring() {
        let mut det = ProximityDetector::new(WarningParams::default());
        for _ in 0..9 {
            assert_eq!(det.push(100.0), None);
        }
        assert!(!det.is_active());
        assert!(matches!(det.push(100.0), Some(WarningTransition::Raised { .. })));
    }

    #[test]
    fn test_warning_clears_after_three_far_frames() {
        let mut det = ProximityDetector::new(WarningParams::default());
        for _ in 0..10 {
            det.push(400.0);
        }
        assert_eq!(det.push(600.0), None);
        assert_eq!(det.push(600.0), None);
        assert_eq!(det.push(600.0), Some(WarningTransition::Cleared { current: 600.0 }));
        assert!(!det.is_active());
    }

    #[test]
    fn test_interrupted_clear_streak_keeps_warning() {
        let mut det = ProximityDetector::new(WarningParams::default());
        for _ in 0..10 {
            det.push(400.0);
        }
        det.push(600.0);
        det.push(600.0);
        assert_eq!(det.push(400.0), None);
        assert!(det.is_active());

        // Streak restarts from zero
        det.push(600.0);
        det.push(600.0);
        assert!(det.is_active());
        assert!(matches!(det.push(600.0), Some(WarningTransition::Cleared { .. })));
    }

    #[test]
    fn test_observe_uses_window_width() {
        let params = WarningParams { window: 2, frames: 1, required_count: 1, ..WarningParams::default() };
        let mut det = ProximityDetector::new(params);
        assert!(matches!(det.observe(&[900, 300, 310, 900]), Some(WarningTransition::Raised { .. })));
        assert_eq!(det.observe(&[100]), None);
    }
}
