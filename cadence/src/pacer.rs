//! CPU-side frame pacing.
use std::{
    thread,
    time::{Duration, Instant},
};

/// Refresh rate assumed when no monitor reports a valid one.
pub const FALLBACK_REFRESH_RATE: f32 = 60.0;

/// Sleeps the calling thread so that CPU frame submission does not outrun the display refresh
/// cadence, bounding the latency of queued-up frames.
///
/// Invoked once per frame from the main loop, before input polling. Not re-entrant.
pub struct FramePacer {
    timer: Instant,
}

impl FramePacer {
    pub fn new() -> FramePacer {
        FramePacer { timer: Instant::now() }
    }

    /// Sleeps for whatever remains of one refresh interval since the previous call.
    ///
    /// Never sleeps a negative duration; if more than one interval has already elapsed the call
    /// returns immediately. The internal timer is reset both before and after the sleep so the
    /// elapsed-time measurement for the next call starts cleanly.
    pub fn pace(&mut self, refresh_rate: f32) {
        assert!(refresh_rate > 0.0, "refresh rate must be positive");
        let interval = Duration::from_secs_f64(1.0 / refresh_rate as f64);
        let elapsed = self.timer.elapsed();
        self.timer = Instant::now();
        if let Some(wait) = interval.checked_sub(elapsed) {
            let wait = compensated(wait);
            if wait > Duration::ZERO {
                thread::sleep(wait);
            }
        }
        self.timer = Instant::now();
    }
}

impl Default for FramePacer {
    fn default() -> Self {
        FramePacer::new()
    }
}

// Windows sleeps in scheduler quanta and overshoots by a roughly constant offset; subtract it
// so the paced interval lands near the target instead of one quantum past it.
#[cfg(windows)]
fn compensated(wait: Duration) -> Duration {
    wait.saturating_sub(Duration::from_micros(500))
}

#[cfg(not(windows))]
fn compensated(wait: Duration) -> Duration {
    wait
}

/// Picks the pacing target from per-monitor refresh rates, reported in millihertz (the unit the
/// windowing layer uses).
///
/// Takes the *minimum* valid rate so that a fast monitor does not build up latency on a slow one,
/// and falls back to [`FALLBACK_REFRESH_RATE`] when nothing valid is reported.
pub fn slowest_refresh_rate(rates_millihertz: impl IntoIterator<Item = Option<u32>>) -> f32 {
    rates_millihertz
        .into_iter()
        .flatten()
        .filter(|&rate| rate > 0)
        .min()
        .map(|millihertz| millihertz as f32 / 1000.0)
        .unwrap_or(FALLBACK_REFRESH_RATE)
}
