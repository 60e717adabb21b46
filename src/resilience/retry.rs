//! Stateful retry operator.
//!
//! Wraps one async call, retrying transport failures that the backoff policy
//! deems retryable. Attempt and error history live only as long as the call.

use super::backoff::{BackoffConfig, HttpMethod, TransportError, delay_for, is_retryable};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Every permitted attempt failed with a retryable error.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("retries exhausted for {resource_id} after {attempts} attempts: {last_error}")]
pub struct RetryExhaustedError<E> {
    pub resource_id: String,
    pub attempts: u32,
    pub last_error: E,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryError<E> {
    /// The error was not eligible for retry and is returned unchanged.
    #[error("{0}")]
    Rejected(E),
    #[error(transparent)]
    Exhausted(RetryExhaustedError<E>),
}

impl<E> RetryError<E> {
    /// The underlying error, whichever way the call ended.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Rejected(err) => err,
            RetryError::Exhausted(exhausted) => exhausted.last_error,
        }
    }
}

/// History of one wrapped call.
#[derive(Debug)]
pub struct RetryState<E> {
    pub attempt: u32,
    pub errors: Vec<E>,
}

impl<E> Default for RetryState<E> {
    fn default() -> Self {
        Self {
            attempt: 0,
            errors: Vec::new(),
        }
    }
}

type RetryHook<E> = Box<dyn FnMut(u32, Duration, &E) + Send>;
type ExhaustedHook<E> = Box<dyn FnMut(&RetryExhaustedError<E>) + Send>;

pub struct RetryOperator<E> {
    resource_id: String,
    method: HttpMethod,
    config: BackoffConfig,
    on_retry: Option<RetryHook<E>>,
    on_exhausted: Option<ExhaustedHook<E>>,
}

impl<E: TransportError + fmt::Display> RetryOperator<E> {
    pub fn new(resource_id: impl Into<String>, method: HttpMethod, config: BackoffConfig) -> Self {
        Self {
            resource_id: resource_id.into(),
            method,
            config,
            on_retry: None,
            on_exhausted: None,
        }
    }

    /// Called with `(attempt, delay, error)` before each wait.
    pub fn on_retry(mut self, hook: impl FnMut(u32, Duration, &E) + Send + 'static) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    pub fn on_exhausted(
        mut self,
        hook: impl FnMut(&RetryExhaustedError<E>) + Send + 'static,
    ) -> Self {
        self.on_exhausted = Some(Box::new(hook));
        self
    }

    pub async fn run<T, F, Fut>(&mut self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut state = RetryState::default();
        loop {
            state.attempt += 1;
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !is_retryable(&err, self.method, &self.config) {
                return Err(RetryError::Rejected(err));
            }

            if state.attempt >= self.config.max_retries {
                let exhausted = RetryExhaustedError {
                    resource_id: self.resource_id.clone(),
                    attempts: state.attempt,
                    last_error: err,
                };
                tracing::warn!(
                    resource = %self.resource_id,
                    attempts = exhausted.attempts,
                    prior_errors = state.errors.len(),
                    "retries exhausted: {}",
                    exhausted.last_error
                );
                if let Some(hook) = self.on_exhausted.as_mut() {
                    hook(&exhausted);
                }
                return Err(RetryError::Exhausted(exhausted));
            }

            let delay = delay_for(&err, state.attempt, &self.config);
            tracing::debug!(
                resource = %self.resource_id,
                attempt = state.attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after transport error: {}",
                err
            );
            if let Some(hook) = self.on_retry.as_mut() {
                hook(state.attempt, delay, &err);
            }
            state.errors.push(err);
            tokio::time::sleep(delay).await;
        }
    }
}
