//! Bandwidth accounting and frame pacing helpers.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Tail of a frame delay that is spin-waited instead of slept, because
/// coarse timers routinely overshoot by several milliseconds.
pub const SPIN_WINDOW: Duration = Duration::from_millis(30);

/// Sliding-window byte rate.
pub struct RateTracker {
    window: Duration,
    samples: VecDeque<(Instant, usize)>,
    total: usize,
}

impl RateTracker {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            total: 0,
        }
    }

    pub fn record(&mut self, bytes: usize) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        self.total += bytes;
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(t, bytes)) = self.samples.front() {
            if now.duration_since(t) <= self.window {
                break;
            }
            self.samples.pop_front();
            self.total -= bytes;
        }
    }

    /// Bytes per second over the window.
    #[must_use]
    pub fn bytes_per_second(&mut self) -> f64 {
        self.evict(Instant::now());
        if self.samples.is_empty() {
            return 0.0;
        }
        self.total as f64 / self.window.as_secs_f64()
    }

    #[must_use]
    pub fn total_in_window(&mut self) -> usize {
        self.evict(Instant::now());
        self.total
    }
}

/// Exponentially smoothed estimate of the interval between ticks.
pub struct IntervalEstimator {
    last: Option<Instant>,
    smoothed_ms: Option<f64>,
    alpha: f64,
}

impl IntervalEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: None,
            smoothed_ms: None,
            alpha: 0.2,
        }
    }

    /// Note one tick; returns the current estimate in milliseconds.
    pub fn tick(&mut self) -> Option<f64> {
        let now = Instant::now();
        if let Some(last) = self.last {
            let sample = now.duration_since(last).as_secs_f64() * 1000.0;
            self.smoothed_ms = Some(match self.smoothed_ms {
                Some(avg) => avg + self.alpha * (sample - avg),
                None => sample,
            });
        }
        self.last = Some(now);
        self.smoothed_ms
    }

    /// The estimate as frames per second, if any interval was seen.
    #[must_use]
    pub fn fps(&self) -> Option<f64> {
        self.smoothed_ms.map(|ms| 1000.0 / ms.max(0.001))
    }
}

impl Default for IntervalEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep until `deadline` with sub-timer precision.
///
/// Coarse-sleeps until [`SPIN_WINDOW`] before the deadline, then yields
/// in a tight loop for the remainder. Returns early when `token` is
/// cancelled.
pub async fn sleep_until_precise(deadline: Instant, token: &CancellationToken) {
    let now = Instant::now();
    if deadline <= now {
        return;
    }
    let remaining = deadline - now;
    if remaining > SPIN_WINDOW {
        tokio::select! {
            () = tokio::time::sleep(remaining - SPIN_WINDOW) => {}
            () = token.cancelled() => return,
        }
    }
    while Instant::now() < deadline {
        if token.is_cancelled() {
            return;
        }
        tokio::task::yield_now().await;
    }
}
