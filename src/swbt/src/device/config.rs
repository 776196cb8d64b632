use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// What happens when a second command arrives while one is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Fail fast with `DeviceError::Busy`.
    #[default]
    Reject,
    /// Wait for the in-flight command, then run.
    Queue,
}

/// Bounded exponential backoff for transient link failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Adds up to half the computed delay at random.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 250,
            max_backoff_ms: 2_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, `attempt` counting from 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        let jitter = if self.jitter && delay > 0 {
            rand::thread_rng().gen_range(0..=delay / 2)
        } else {
            0
        };
        Duration::from_millis(delay + jitter)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config parse: {0}")]
    Parse(String),
    #[error("retry.max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}

/// Tunables for one [`super::DeviceController`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub retry: RetryPolicy,
    pub connect_timeout_ms: u64,
    /// How long to wait for a notification carrying the reply.
    pub response_timeout_ms: u64,
    /// Idle time after which the link is dropped; zero disconnects after every command.
    pub disconnect_delay_ms: u64,
    pub busy_policy: BusyPolicy,
    pub write_with_response: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            connect_timeout_ms: 10_000,
            response_timeout_ms: 5_000,
            disconnect_delay_ms: 90_000,
            busy_policy: BusyPolicy::Reject,
            write_with_response: false,
        }
    }
}

impl ControllerConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("connect_timeout_ms"));
        }
        if self.response_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("response_timeout_ms"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.disconnect_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let config =
            ControllerConfig::from_json_str(r#"{"busy_policy":"queue","retry":{"max_attempts":5}}"#)
                .unwrap();
        assert_eq!(config.busy_policy, BusyPolicy::Queue);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_backoff_ms, 250);
        assert_eq!(config.disconnect_delay(), Duration::from_secs(90));
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = ControllerConfig::from_json_str(r#"{"retry":{"max_attempts":0}}"#).unwrap_err();
        assert_eq!(err, ConfigError::ZeroAttempts);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(10), Duration::from_millis(2_000));
    }

    #[test]
    fn jitter_stays_within_half_delay() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.backoff(2);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(750));
        }
    }
}
