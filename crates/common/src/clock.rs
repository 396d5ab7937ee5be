//! Frame timing utilities.
//!
//! Encoded frames carry timing derived purely from the caller's frame
//! counter and the negotiated frame rate, so a stream is reproducible
//! regardless of when frames were actually grabbed. This module provides:
//! - Frame duration and timestamp derivation
//! - The integral target rate used for GOP and sampling decisions
//! - An interval tracker for expected-vs-real pacing diagnostics

use std::time::Instant;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Rate assumed when the frame rate is not usable (zero numerator or denominator).
pub const FALLBACK_TARGET_FPS: u32 = 60;

/// Integral frames per second for a rational rate, never below 1.
pub fn target_fps(fps_n: u32, fps_d: u32) -> u32 {
    if fps_n > 0 && fps_d > 0 {
        (fps_n / fps_d).max(1)
    } else {
        FALLBACK_TARGET_FPS
    }
}

/// Duration of one frame in nanoseconds: `1e9 * fps_d / fps_n`.
///
/// Returns 0 for a zero numerator.
pub fn frame_duration_ns(fps_n: u32, fps_d: u32) -> u64 {
    if fps_n == 0 {
        return 0;
    }
    NANOS_PER_SEC * u64::from(fps_d) / u64::from(fps_n)
}

/// Presentation timestamp of a frame: `frame_index * duration`.
pub fn frame_timestamp_ns(frame_index: u64, duration_ns: u64) -> u64 {
    frame_index.saturating_mul(duration_ns)
}

/// One pacing sample: how far apart two captures were versus the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalSample {
    /// Target interval in microseconds.
    pub expected_us: u64,
    /// Measured interval since the previous capture in microseconds.
    pub real_us: u64,
}

impl IntervalSample {
    /// Positive when the caller is slower than the target rate.
    pub fn lag_us(&self) -> i64 {
        self.real_us as i64 - self.expected_us as i64
    }
}

/// Tracks the wall-clock spacing between consecutive captures.
#[derive(Debug, Default)]
pub struct IntervalTracker {
    last: Option<Instant>,
}

impl IntervalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a capture at `now`. The first call has nothing to compare
    /// against and returns `None`.
    pub fn record(&mut self, now: Instant, expected_ns: u64) -> Option<IntervalSample> {
        let sample = self.last.map(|last| IntervalSample {
            expected_us: expected_ns / 1_000,
            real_us: now.saturating_duration_since(last).as_micros() as u64,
        });
        self.last = Some(now);
        sample
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn duration_and_timestamp_at_thirty_fps() {
        let duration = frame_duration_ns(30, 1);
        assert_eq!(duration, 33_333_333);
        assert_eq!(frame_timestamp_ns(10, duration), 333_333_330);
    }

    #[test]
    fn ntsc_rate_duration() {
        assert_eq!(frame_duration_ns(30_000, 1_001), 33_366_666);
    }

    #[test]
    fn zero_numerator_has_no_duration() {
        assert_eq!(frame_duration_ns(0, 1), 0);
    }

    #[test]
    fn target_fps_falls_back_and_clamps() {
        assert_eq!(target_fps(60, 1), 60);
        assert_eq!(target_fps(0, 1), FALLBACK_TARGET_FPS);
        assert_eq!(target_fps(30, 0), FALLBACK_TARGET_FPS);
        assert_eq!(target_fps(1, 2), 1);
    }

    #[test]
    fn interval_tracker_skips_first_capture() {
        let mut tracker = IntervalTracker::new();
        let start = Instant::now();
        assert!(tracker.record(start, 33_333_333).is_none());

        let sample = tracker
            .record(start + Duration::from_millis(40), 33_333_333)
            .unwrap();
        assert_eq!(sample.expected_us, 33_333);
        assert_eq!(sample.real_us, 40_000);
        assert_eq!(sample.lag_us(), 6_667);

        tracker.reset();
        assert!(tracker.record(start, 33_333_333).is_none());
    }

    proptest! {
        #[test]
        fn timestamps_advance_by_one_duration(
            fps_n in 1u32..=240,
            fps_d in 1u32..=1001,
            index in 0u64..1_000_000,
        ) {
            let duration = frame_duration_ns(fps_n, fps_d);
            let here = frame_timestamp_ns(index, duration);
            let next = frame_timestamp_ns(index + 1, duration);
            prop_assert_eq!(next - here, duration);
        }
    }
}
