// ABOUTME: Geometric backoff calculator for connection retry delays
//
// Produces `min(initial * multiplier^attempt, max)` for successive attempts.
// With the client defaults (0.5s, x1.5, cap 2.0s) the sequence is
// 0.5s, 0.75s, 1.125s, 1.6875s, 2.0s, 2.0s, ...

use std::time::Duration;

/// Backoff calculator for retry delays
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay after the first failure
    initial: Duration,

    /// Maximum delay cap
    max: Duration,

    /// Growth factor per attempt
    multiplier: f64,

    /// Current attempt number (0-indexed)
    current_attempt: u32,
}

impl Backoff {
    /// Create a new backoff calculator
    ///
    /// # Arguments
    /// * `initial` - Delay returned by the first call to `next_delay`
    /// * `multiplier` - Factor applied per attempt (values below 1.0 are treated as 1.0)
    /// * `max` - Maximum delay cap
    #[must_use]
    pub const fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier,
            current_attempt: 0,
        }
    }

    /// Calculate the next delay and increment the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.current_attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);

        self.current_attempt = self.current_attempt.saturating_add(1);

        // powi saturates to infinity long before Duration would overflow
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}
