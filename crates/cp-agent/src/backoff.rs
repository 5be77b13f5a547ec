//! Retry delays for reconnection and startup registration

use std::time::Duration;

use cp_core::config::BackoffConfig;

/// Exponential backoff with jitter for reconnection attempts
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay to start from after a reset
    initial: Duration,
    /// Current delay
    current: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial,
            max,
            multiplier,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Get the next delay and advance the backoff.
    ///
    /// Jitter is applied downwards so the returned delay never exceeds `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        delay.saturating_sub(Duration::from_secs_f64(jitter_amount))
    }

    /// Go back to the initial delay after a successful attempt
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Fibonacci backoff (1, 1, 2, 3, 5, ... units) capped at `max`
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    unit: Duration,
    max: Duration,
    prev: u32,
    curr: u32,
}

impl FibonacciBackoff {
    pub fn new(unit: Duration, max: Duration) -> Self {
        Self {
            unit,
            max,
            prev: 0,
            curr: 1,
        }
    }

    /// Get the next delay and advance the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = std::cmp::min(self.unit.saturating_mul(self.curr), self.max);
        let next = self.prev.saturating_add(self.curr);
        self.prev = self.curr;
        self.curr = next;
        delay
    }
}
