use crate::domain::failure::FlowError;
use crate::resilience::circuit_breaker::CircuitOpenError;
use crate::resilience::retry::RetryExhaustedError;
use std::fmt::Display;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Flow error: {0}")]
    FlowError(#[from] FlowError),
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
    #[error("Retries exhausted for {resource_id} after {attempts} attempts: {last_error}")]
    RetryExhausted {
        resource_id: String,
        attempts: u32,
        last_error: String,
    },
    #[error("Scenario error: {0}")]
    ScenarioError(String),
    #[error("Flow runtime has shut down")]
    Shutdown,
}

impl<E: Display> From<RetryExhaustedError<E>> for PaymentError {
    fn from(err: RetryExhaustedError<E>) -> Self {
        PaymentError::RetryExhausted {
            resource_id: err.resource_id,
            attempts: err.attempts,
            last_error: err.last_error.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;
