//! Circuit breaker for provider endpoints.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: endpoint assumed down, requests fail fast
//! - Half-Open: probing whether the endpoint recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_threshold failures, each within failure_window of the previous
//! Open → Half-Open: first can_request after reset_timeout
//! Half-Open → Closed: success_threshold successes
//! Half-Open → Open: any failure
//! ```
//!
//! Circuits are keyed by normalized endpoint (scheme, host and path; query
//! and fragment stripped) and owned by the breaker instance.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    pub reset_timeout_ms: u64,
    pub success_threshold: u32,
    pub failure_status_codes: Vec<u16>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 60_000,
            reset_timeout_ms: 30_000,
            success_threshold: 2,
            failure_status_codes: (500..=599).chain([429]).collect(),
        }
    }
}

impl CircuitBreakerConfig {
    fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitInfo {
    pub state: CircuitState,
    pub failures: u32,
    pub last_failure: Option<Instant>,
    pub successes: u32,
    pub opened_at: Option<Instant>,
}

impl Default for CircuitInfo {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure: None,
            successes: 0,
            opened_at: None,
        }
    }
}

impl CircuitInfo {
    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.successes = 0;
    }

    fn close(&mut self) {
        *self = CircuitInfo::default();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit open for {key}, retry in {}ms", retry_after.as_millis())]
pub struct CircuitOpenError {
    pub key: String,
    pub retry_after: Duration,
}

/// Outcome of a breaker-guarded call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GuardedError<E> {
    #[error(transparent)]
    Open(CircuitOpenError),
    #[error("{0}")]
    Call(E),
}

/// Strips query and fragment, keeping scheme, host (with port) and path.
pub fn normalize_key(endpoint: &str) -> String {
    match url::Url::parse(endpoint) {
        Ok(url) => {
            let host = url.host_str().unwrap_or_default();
            let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
            format!("{}://{}{}{}", url.scheme(), host, port, url.path())
        }
        Err(_) => endpoint
            .split(['?', '#'])
            .next()
            .unwrap_or(endpoint)
            .to_string(),
    }
}

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, CircuitInfo>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn circuits(&self) -> MutexGuard<'_, HashMap<String, CircuitInfo>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn can_request(&self, endpoint: &str) -> Result<(), CircuitOpenError> {
        let key = normalize_key(endpoint);
        let now = Instant::now();
        let mut circuits = self.circuits();
        let Some(info) = circuits.get_mut(&key) else {
            return Ok(());
        };

        match info.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let opened_at = info.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed < self.config.reset_timeout() {
                    Err(CircuitOpenError {
                        key,
                        retry_after: self.config.reset_timeout() - elapsed,
                    })
                } else {
                    info.state = CircuitState::HalfOpen;
                    info.successes = 0;
                    tracing::info!(circuit = %key, "circuit half-open, allowing probe");
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self, endpoint: &str) {
        let key = normalize_key(endpoint);
        let mut circuits = self.circuits();
        let Some(info) = circuits.get_mut(&key) else {
            return;
        };

        match info.state {
            CircuitState::Closed => info.failures = 0,
            CircuitState::HalfOpen => {
                info.successes += 1;
                if info.successes >= self.config.success_threshold {
                    info.close();
                    tracing::info!(circuit = %key, "circuit closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Failures whose status is outside `failure_status_codes` are ignored.
    /// A failure without status (connection error, timeout) always counts.
    pub fn record_failure(&self, endpoint: &str, status: Option<u16>) {
        if let Some(code) = status
            && !self.config.failure_status_codes.contains(&code)
        {
            return;
        }

        let key = normalize_key(endpoint);
        let now = Instant::now();
        let mut circuits = self.circuits();
        let info = circuits.entry(key.clone()).or_default();

        match info.state {
            CircuitState::Closed => {
                let stale = info
                    .last_failure
                    .is_some_and(|last| now.saturating_duration_since(last) > self.config.failure_window());
                info.failures = if stale { 1 } else { info.failures + 1 };
                info.last_failure = Some(now);
                if info.failures >= self.config.failure_threshold {
                    info.open(now);
                    tracing::warn!(circuit = %key, failures = info.failures, "circuit opened");
                }
            }
            CircuitState::HalfOpen => {
                info.last_failure = Some(now);
                info.open(now);
                tracing::warn!(circuit = %key, "probe failed, circuit reopened");
            }
            CircuitState::Open => info.last_failure = Some(now),
        }
    }

    pub fn snapshot(&self, endpoint: &str) -> Option<CircuitInfo> {
        self.circuits().get(&normalize_key(endpoint)).cloned()
    }

    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.snapshot(endpoint)
            .map(|info| info.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn reset(&self, endpoint: &str) {
        self.circuits().remove(&normalize_key(endpoint));
    }

    /// Runs `call` if the circuit allows it and records the outcome.
    ///
    /// `status_of` extracts the status code a failure should be judged by.
    pub async fn call<T, E, Fut>(
        &self,
        endpoint: &str,
        call: Fut,
        status_of: impl Fn(&E) -> Option<u16>,
    ) -> Result<T, GuardedError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.can_request(endpoint).map_err(GuardedError::Open)?;
        match call.await {
            Ok(value) => {
                self.record_success(endpoint);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(endpoint, status_of(&err));
                Err(GuardedError::Call(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENDPOINT: &str = "https://api.stripe.test/v1/payment_intents?expand=charges";

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window_ms: 1_000,
            reset_timeout_ms: 5_000,
            success_threshold: 2,
            ..CircuitBreakerConfig::default()
        })
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(
            normalize_key(ENDPOINT),
            "https://api.stripe.test/v1/payment_intents"
        );
        assert_eq!(
            normalize_key("http://localhost:8080/status#frag"),
            "http://localhost:8080/status"
        );
        assert_eq!(normalize_key("relative/path?x=1"), "relative/path");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_ineligible_status() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure(ENDPOINT, Some(400));
        }
        assert!(breaker.snapshot(ENDPOINT).is_none());
        assert!(breaker.can_request(ENDPOINT).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sparse_failures_do_not_accumulate() {
        let breaker = breaker();
        breaker.record_failure(ENDPOINT, Some(500));
        breaker.record_failure(ENDPOINT, Some(500));
        tokio::time::advance(Duration::from_millis(1_500)).await;
        breaker.record_failure(ENDPOINT, Some(500));

        let info = breaker.snapshot(ENDPOINT).unwrap();
        assert_eq!(info.failures, 1);
        assert_eq!(info.state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_in_closed_resets_failures() {
        let breaker = breaker();
        breaker.record_failure(ENDPOINT, None);
        breaker.record_failure(ENDPOINT, Some(503));
        breaker.record_success(ENDPOINT);
        assert_eq!(breaker.snapshot(ENDPOINT).unwrap().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure(ENDPOINT, Some(502));
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(breaker.can_request(ENDPOINT).is_ok());

        breaker.record_success(ENDPOINT);
        assert_eq!(breaker.state(ENDPOINT), CircuitState::HalfOpen);
        breaker.record_success(ENDPOINT);
        assert_eq!(breaker.state(ENDPOINT), CircuitState::Closed);
        assert_eq!(breaker.snapshot(ENDPOINT).unwrap(), CircuitInfo::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_call_short_circuits() {
        let breaker = breaker();
        for _ in 0..3 {
            let result: Result<(), _> = breaker
                .call(ENDPOINT, async { Err::<(), u16>(503) }, |s| Some(*s))
                .await;
            assert_eq!(result, Err(GuardedError::Call(503)));
        }

        let result: Result<u8, GuardedError<u16>> =
            breaker.call(ENDPOINT, async { Ok(1) }, |s| Some(*s)).await;
        assert!(matches!(result, Err(GuardedError::Open(_))));
    }
}
