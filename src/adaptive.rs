//! Load-adaptive scan interval.
//!
//! Tracks a rolling window of recent scan execution times and scales the
//! configured base interval: sustained overruns widen the interval toward a
//! multiplier cap, light load narrows it slightly below base. Keeps a slow
//! machine from drowning in scan work without a config change.

use std::collections::VecDeque;
use std::time::Duration;

/// Samples kept in the rolling window
const WINDOW: usize = 30;

/// Hard widening cap relative to the base interval
const MAX_FACTOR: f64 = 4.0;

/// Mild speed-up under light load
const MIN_FACTOR: f64 = 0.7;

pub struct AdaptiveInterval {
    base: Duration,
    samples: VecDeque<Duration>,
}

impl AdaptiveInterval {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            samples: VecDeque::with_capacity(WINDOW),
        }
    }

    /// Swap the base interval, keeping the load history
    pub fn set_base(&mut self, base: Duration) {
        self.base = base;
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Record the execution time of one completed scan iteration
    pub fn record(&mut self, execution_time: Duration) {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(execution_time);
    }

    /// Mean execution time over the window
    pub fn mean_execution_time(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    /// Current interval, scaled by recent load.
    ///
    /// No history yet means the base interval. Mean execution time far above
    /// the base widens proportionally up to 4x base; mean below roughly a
    /// third of the base narrows to 0.7x.
    pub fn current(&self) -> Duration {
        if self.samples.is_empty() {
            return self.base;
        }

        let base_ms = self.base.as_secs_f64() * 1000.0;
        let mean_ms = self.mean_execution_time().as_secs_f64() * 1000.0;

        let factor = if mean_ms > base_ms * 2.0 {
            (mean_ms / base_ms).min(MAX_FACTOR)
        } else if mean_ms > base_ms {
            2.0
        } else if mean_ms < base_ms / 3.0 {
            MIN_FACTOR
        } else {
            1.0
        };

        Duration::from_secs_f64(self.base.as_secs_f64() * factor)
    }

    /// Drop the load history (stop/start boundary)
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}
