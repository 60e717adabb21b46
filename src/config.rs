use crate::application::fallback::state::FallbackConfig;
use crate::application::flow::config::FlowConfig;
use crate::error::{PaymentError, Result};
use crate::resilience::backoff::BackoffConfig;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Every tunable of the engine. Missing fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub flow: FlowConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub fallback: FallbackConfig,
    /// Transport retries applied by the resilient gateway.
    pub backoff: BackoffConfig,
}

impl EngineConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let flow = &self.flow;
        ensure(flow.polling.base_delay_ms > 0, "flow.polling.base_delay_ms must be positive")?;
        ensure(
            flow.polling.base_delay_ms <= flow.polling.max_delay_ms,
            "flow.polling.base_delay_ms exceeds max_delay_ms",
        )?;
        ensure(flow.polling.max_attempts > 0, "flow.polling.max_attempts must be positive")?;
        ensure(
            flow.status_retry.base_delay_ms <= flow.status_retry.max_delay_ms,
            "flow.status_retry.base_delay_ms exceeds max_delay_ms",
        )?;
        ensure(
            flow.processing.max_duration_ms > 0,
            "flow.processing.max_duration_ms must be positive",
        )?;
        ensure(
            (0.0..=1.0).contains(&flow.jitter_factor),
            "flow.jitter_factor must be within [0, 1]",
        )?;

        let backoff = &self.backoff;
        ensure(
            backoff.initial_delay_ms <= backoff.max_delay_ms,
            "backoff.initial_delay_ms exceeds max_delay_ms",
        )?;
        ensure(backoff.backoff_multiplier >= 1.0, "backoff.backoff_multiplier must be at least 1")?;
        ensure(
            (0.0..=1.0).contains(&backoff.jitter_factor),
            "backoff.jitter_factor must be within [0, 1]",
        )?;

        let breaker = &self.circuit_breaker;
        ensure(breaker.failure_threshold > 0, "circuit_breaker.failure_threshold must be positive")?;
        ensure(breaker.success_threshold > 0, "circuit_breaker.success_threshold must be positive")?;

        ensure(self.fallback.max_attempts > 0, "fallback.max_attempts must be positive")?;
        Ok(())
    }
}

fn ensure(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(PaymentError::ConfigError(message.to_string()))
    }
}
