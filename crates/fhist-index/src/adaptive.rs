//! Adaptive sleep interval for batch workers.

use std::time::Duration;

const WINDOW: usize = 16;
/// Interval as a multiple of the median commit latency.
const LATENCY_FACTOR: u32 = 4;

/// Running median of the last commit latencies, scaled and clamped to
/// `[min, max]`. Slow commits stretch the interval so each commit carries
/// more items; fast commits shorten it to keep latency low.
#[derive(Debug, Clone)]
pub struct AdaptiveTimer {
    samples: [Duration; WINDOW],
    len: usize,
    next: usize,
    min: Duration,
    max: Duration,
}

impl AdaptiveTimer {
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            samples: [Duration::ZERO; WINDOW],
            len: 0,
            next: 0,
            min,
            max: max.max(min),
        }
    }

    pub fn record(&mut self, latency: Duration) {
        self.samples[self.next] = latency;
        self.next = (self.next + 1) % WINDOW;
        self.len = (self.len + 1).min(WINDOW);
    }

    #[must_use]
    pub fn median(&self) -> Option<Duration> {
        if self.len == 0 {
            return None;
        }
        let mut window = self.samples;
        let window = &mut window[..self.len];
        window.sort_unstable();
        Some(window[self.len / 2])
    }

    /// Current sleep interval; `min` until a commit has been observed.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.median().map_or(self.min, |median| {
            median
                .saturating_mul(LATENCY_FACTOR)
                .clamp(self.min, self.max)
        })
    }
}
