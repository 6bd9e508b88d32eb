use std::time::Duration;

/// Exponential backoff policy.
///
/// - initial_delay: base delay for attempt 0
/// - multiplier: factor by which delay grows each attempt (> 1.0)
/// - max_delay: cap for the computed delay
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub const fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    /// Doubling policy between the given bounds, the shape used for both
    /// transport polls and sink commits.
    pub const fn doubling(initial_delay: Duration, max_delay: Duration) -> Self {
        Self::new(initial_delay, 2.0, max_delay)
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        let pow = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        // mul_f64 panics on overflow, so compare in seconds before scaling
        let scaled_secs = self.initial_delay.as_secs_f64() * pow;
        if !scaled_secs.is_finite() || scaled_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        self.initial_delay.mul_f64(pow)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::doubling(Duration::from_millis(100), Duration::from_secs(30))
    }
}
