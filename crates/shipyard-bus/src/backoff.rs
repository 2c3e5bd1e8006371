//! Retry schedule for attaching to topics.

use std::time::Duration;

use shipyard_config::BackoffSettings;

/// Exponential backoff: `initial`, then each delay multiplied by
/// `multiplier`, for at most `max_attempts` attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffSettings::default())
    }
}

impl From<&BackoffSettings> for BackoffPolicy {
    fn from(settings: &BackoffSettings) -> Self {
        Self {
            initial: Duration::from_millis(settings.initial_ms),
            multiplier: settings.multiplier,
            max_attempts: settings.max_attempts,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        self.initial.mul_f64(self.multiplier.max(1.0).powi(exponent))
    }

    /// Sum of all delays before the final attempt.
    pub fn total_wait(&self) -> Duration {
        (1..self.max_attempts).map(|a| self.delay_after(a)).sum()
    }
}
