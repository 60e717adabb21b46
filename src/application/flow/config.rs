use crate::resilience::backoff::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            max_attempts: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusRetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for StatusRetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 5_000,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Absolute age limit of a flow, independent of attempt counters.
    pub max_duration_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_duration_ms: 300_000,
        }
    }
}

impl ProcessingConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub polling: PollingConfig,
    pub status_retry: StatusRetryConfig,
    pub processing: ProcessingConfig,
    /// Jitter applied to polling and status-retry delays.
    pub jitter_factor: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            polling: PollingConfig::default(),
            status_retry: StatusRetryConfig::default(),
            processing: ProcessingConfig::default(),
            jitter_factor: 0.1,
        }
    }
}

impl FlowConfig {
    pub fn polling_backoff(&self) -> BackoffConfig {
        BackoffConfig::exponential(self.polling.base_delay_ms, self.polling.max_delay_ms)
            .with_jitter(self.jitter_factor)
            .with_max_retries(self.polling.max_attempts)
    }

    pub fn status_retry_backoff(&self) -> BackoffConfig {
        BackoffConfig::exponential(self.status_retry.base_delay_ms, self.status_retry.max_delay_ms)
            .with_jitter(self.jitter_factor)
            .with_max_retries(self.status_retry.max_retries)
    }
}
