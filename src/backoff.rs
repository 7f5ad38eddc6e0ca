//! Exponential reconnection delay.

use std::time::Duration;

use crate::config::BackoffConfig;

impl BackoffConfig {
    /// Delay before the next attempt given the attempts already made, or
    /// `None` once the ceiling is reached.
    ///
    /// `delay = base_delay * 2^attempts`, saturating instead of overflowing.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Option<Duration> {
        if attempts >= self.max_attempts {
            return None;
        }
        let factor = 2_u32.checked_pow(attempts).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor))
    }
}
