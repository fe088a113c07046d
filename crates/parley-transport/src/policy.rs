use std::time::Duration;

use parley_core::config::{ReconnectConfig, TransportConfig};

/// Exponential backoff bounds for automatic reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(value: &ReconnectConfig) -> Self {
        Self {
            max_attempts: value.max_attempts,
            base_delay: Duration::from_millis(value.base_delay_ms),
            max_delay: Duration::from_millis(value.max_delay_ms),
        }
    }
}

impl From<&TransportConfig> for ReconnectPolicy {
    fn from(value: &TransportConfig) -> Self {
        Self::from(&value.reconnect)
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt: `min(base * 2^(attempt-1), max)`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(16);
        let multiplier = 1u128 << exponent;
        let backoff_ms = self.base_delay.as_millis().saturating_mul(multiplier);
        let bounded_ms = backoff_ms.min(self.max_delay.as_millis());
        Duration::from_millis(bounded_ms as u64)
    }

    pub fn allows(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_attempts
    }
}
