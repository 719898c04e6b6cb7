//! Retry policy and queueing for outgoing payloads.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_delays"))]
pub struct DeliveryConfig {
    /// Publish attempts per payload, including the first one.
    #[validate(range(min = 1, max = 100, message = "max_attempts must be between 1 and 100"))]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds. Doubles per retry.
    #[validate(range(min = 1, message = "base_delay_ms must be at least 1"))]
    pub base_delay_ms: u64,

    /// Upper bound for a single retry delay, in milliseconds.
    #[validate(range(min = 1, message = "max_delay_ms must be at least 1"))]
    pub max_delay_ms: u64,

    /// Draw each delay uniformly from `[delay / 2, delay]`.
    pub jitter: bool,

    /// Payloads waiting for a delivery slot. When full, the oldest is dropped.
    #[validate(range(
        min = 1,
        max = 100_000,
        message = "queue_capacity must be between 1 and 100000"
    ))]
    pub queue_capacity: usize,

    /// Payloads delivered concurrently. `1` keeps submission order.
    #[validate(range(min = 1, max = 64, message = "max_in_flight must be between 1 and 64"))]
    pub max_in_flight: usize,

    /// How long in-flight attempts may run after shutdown starts, in milliseconds.
    #[validate(range(max = 60_000, message = "shutdown_grace_ms must not exceed 60000"))]
    pub shutdown_grace_ms: u64,
}

impl DeliveryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
            jitter: true,
            queue_capacity: 64,
            max_in_flight: 1,
            shutdown_grace_ms: 2_000,
        }
    }
}

fn validate_delays(config: &DeliveryConfig) -> Result<(), ValidationError> {
    if config.max_delay_ms < config.base_delay_ms {
        return Err(ValidationError::new("max_delay_below_base")
            .with_message("max_delay_ms must not be lower than base_delay_ms".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delivery_config_is_valid() {
        let config = DeliveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.base_delay(), Duration::from_secs(1));
        assert_eq!(config.max_delay(), Duration::from_secs(8));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = DeliveryConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_delay_below_base_rejected() {
        let config = DeliveryConfig {
            base_delay_ms: 5_000,
            max_delay_ms: 1_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
