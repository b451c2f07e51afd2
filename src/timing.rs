//! Frame-rate and latency bookkeeping for a run.

use std::fmt;
use std::time::Duration;

/// Number of timestamps kept for the rolling frame rate.
pub const TIMING_WINDOW_LEN: usize = 10;

/// Circular buffer of the most recent forwarded-frame timestamps (seconds).
#[derive(Clone, Debug, Default)]
pub struct TimingWindow {
    stamps: [f64; TIMING_WINDOW_LEN],
    pos: usize,
    count: usize,
}

impl TimingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, timestamp: f64) {
        self.stamps[self.pos] = timestamp;
        self.pos = (self.pos + 1) % TIMING_WINDOW_LEN;
        self.count = (self.count + 1).min(TIMING_WINDOW_LEN);
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Frames per second over the buffered span, once two stamps exist.
    pub fn rolling_fps(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        let newest = self.stamps[(self.pos + TIMING_WINDOW_LEN - 1) % TIMING_WINDOW_LEN];
        let oldest = if self.count == TIMING_WINDOW_LEN {
            self.stamps[self.pos]
        } else {
            self.stamps[0]
        };
        let span = newest - oldest;
        if span > 0.0 {
            Some((self.count - 1) as f64 / span)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The next frame arrived at or after the time budget.
    BudgetExhausted,
    /// The cancel flag was raised.
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::BudgetExhausted => f.write_str("time budget exhausted"),
            StopReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Outcome of a driver run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
    pub warmup_frames: u64,
    pub reconfigurations: u64,
    pub total_track_time: Duration,
    pub time_budget: Duration,
    pub stop_reason: StopReason,
    /// Timestamp handed to tracking with the last forwarded frame.
    pub last_timestamp: Option<f64>,
    pub rolling_fps: Option<f64>,
}

impl RunReport {
    /// Mean tracking latency per forwarded frame. `None` when nothing was forwarded.
    pub fn mean_track_time(&self) -> Option<Duration> {
        if self.frames_forwarded == 0 {
            return None;
        }
        match u32::try_from(self.frames_forwarded) {
            Ok(frames) => Some(self.total_track_time / frames),
            Err(_) => Some(Duration::from_secs_f64(
                self.total_track_time.as_secs_f64() / self.frames_forwarded as f64,
            )),
        }
    }

    /// Forwarded frames over the configured budget. `None` when nothing was forwarded.
    pub fn mean_fps(&self) -> Option<f64> {
        let budget = self.time_budget.as_secs_f64();
        if self.frames_forwarded == 0 || budget <= 0.0 {
            return None;
        }
        Some(self.frames_forwarded as f64 / budget)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.mean_track_time(), self.mean_fps()) {
            (Some(track), Some(fps)) => write!(
                f,
                "Mean track time: {:.4} s, mean fps: {:.2} ({} frames, {})",
                track.as_secs_f64(),
                fps,
                self.frames_forwarded,
                self.stop_reason
            ),
            _ => write!(f, "no frames processed ({})", self.stop_reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(frames_forwarded: u64, total_track_time: Duration) -> RunReport {
        RunReport {
            frames_forwarded,
            frames_dropped: 0,
            warmup_frames: 30,
            reconfigurations: 0,
            total_track_time,
            time_budget: Duration::from_secs(2),
            stop_reason: StopReason::BudgetExhausted,
            last_timestamp: None,
            rolling_fps: None,
        }
    }

    #[test]
    fn rolling_fps_needs_two_stamps() {
        let mut window = TimingWindow::new();
        assert_eq!(window.rolling_fps(), None);
        window.push(0.5);
        assert_eq!(window.rolling_fps(), None);
        window.push(0.6);
        let fps = window.rolling_fps().expect("fps");
        assert!((fps - 10.0).abs() < 1e-9);
    }

    #[test]
    fn rolling_fps_uses_only_the_last_ten_stamps() {
        let mut window = TimingWindow::new();
        // Slow start, then a steady 30 fps.
        for i in 0..5 {
            window.push(i as f64);
        }
        for i in 0..20 {
            window.push(10.0 + i as f64 / 30.0);
        }
        assert_eq!(window.len(), TIMING_WINDOW_LEN);
        let fps = window.rolling_fps().expect("fps");
        assert!((fps - 30.0).abs() < 1e-6, "fps {}", fps);
    }

    #[test]
    fn means_divide_by_forwarded_frames() {
        let r = report(4, Duration::from_millis(100));
        assert_eq!(r.mean_track_time(), Some(Duration::from_millis(25)));
        assert_eq!(r.mean_fps(), Some(2.0));
        assert!(r.to_string().starts_with("Mean track time: 0.0250 s, mean fps: 2.00"));
    }

    #[test]
    fn mean_track_time_survives_counts_beyond_u32() {
        let frames = u64::from(u32::MAX) * 4;
        let r = report(frames, Duration::from_secs(frames / 1000));
        let mean = r.mean_track_time().expect("frames were forwarded");
        assert!((mean.as_secs_f64() - 0.001).abs() < 1e-9, "mean {:?}", mean);
    }

    #[test]
    fn zero_frames_reports_no_frames_processed() {
        let r = report(0, Duration::ZERO);
        assert_eq!(r.mean_track_time(), None);
        assert_eq!(r.mean_fps(), None);
        assert_eq!(r.to_string(), "no frames processed (time budget exhausted)");
    }
}
