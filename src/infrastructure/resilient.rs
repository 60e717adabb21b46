use crate::domain::context::ReferenceKind;
use crate::domain::failure::{
    ErrorCode, FlowError, PARAM_HTTP_STATUS, PARAM_RETRY_AFTER, PARAM_RETRY_AFTER_MS,
};
use crate::domain::ports::{
    ClientConfirmRequest, ConfirmParams, FinalizeRequest, PaymentGateway, ProviderResult,
    SharedGateway, SharedRegistry,
};
use crate::domain::request::PaymentRequest;
use crate::resilience::backoff::{BackoffConfig, HttpMethod, TransportError, retry_after_delay};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitOpenError, GuardedError};
use crate::resilience::retry::{RetryError, RetryOperator};
use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

impl TransportError for FlowError {
    fn status_code(&self) -> Option<u16> {
        self.http_status()
    }

    fn retry_after(&self) -> Option<&str> {
        self.param(PARAM_RETRY_AFTER)
    }
}

impl From<CircuitOpenError> for FlowError {
    fn from(open: CircuitOpenError) -> Self {
        FlowError::new(ErrorCode::CircuitOpen)
            .with_param(PARAM_RETRY_AFTER_MS, open.retry_after.as_millis())
            .with_param("circuit", open.key)
    }
}

/// Transport-level failures count against the circuit; business rejections do not.
fn counts_against_circuit(error: &FlowError) -> bool {
    error.http_status().is_some()
        || matches!(
            error.code,
            ErrorCode::ProviderUnavailable | ErrorCode::ProcessingTimeout
        )
}

/// Turns a raw `Retry-After` on a rate-limit error into a cooldown the flow can honour.
fn with_cooldown(error: FlowError, backoff: &BackoffConfig) -> FlowError {
    if error.code != ErrorCode::RateLimited || error.param(PARAM_RETRY_AFTER_MS).is_some() {
        return error;
    }
    let delay = error
        .param(PARAM_RETRY_AFTER)
        .and_then(|value| retry_after_delay(value, backoff, Utc::now()));
    match delay {
        Some(delay) => error.with_param(PARAM_RETRY_AFTER_MS, delay.as_millis()),
        None => error,
    }
}

/// Decorates a gateway with a per-provider circuit breaker and transport retries.
///
/// Every attempt passes through the breaker; the retry policy then decides,
/// by HTTP method and status, whether a failed attempt is tried again.
pub struct ResilientGateway {
    inner: SharedGateway,
    registry: SharedRegistry,
    breaker: Arc<CircuitBreaker>,
    backoff: BackoffConfig,
}

impl ResilientGateway {
    pub fn new(
        inner: SharedGateway,
        registry: SharedRegistry,
        breaker: Arc<CircuitBreaker>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            inner,
            registry,
            breaker,
            backoff,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn endpoint(&self, provider: &str) -> String {
        self.registry
            .available_providers()
            .into_iter()
            .find(|p| p.id == provider)
            .map(|p| p.endpoint())
            .unwrap_or_else(|| format!("provider://{provider}"))
    }

    async fn guarded<F, Fut>(
        &self,
        provider: &str,
        operation: &'static str,
        method: HttpMethod,
        mut call: F,
    ) -> ProviderResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult>,
    {
        let endpoint = self.endpoint(provider);
        let resource = format!("{provider}:{operation}");
        let mut retry = RetryOperator::new(resource, method, self.backoff.clone()).on_retry(
            move |attempt, delay, error: &FlowError| {
                debug!(operation, attempt, delay_ms = delay.as_millis() as u64, code = %error.code, "retrying provider call");
            },
        );

        let outcome = retry
            .run(|| {
                let attempt = call();
                let endpoint = endpoint.as_str();
                async move {
                    let attempt = async move {
                        match attempt.await {
                            Err(error) if counts_against_circuit(&error) => Err(error),
                            other => Ok(other),
                        }
                    };
                    match self.breaker.call(endpoint, attempt, FlowError::http_status).await {
                        Ok(result) => result,
                        Err(GuardedError::Open(open)) => Err(FlowError::from(open)),
                        Err(GuardedError::Call(error)) => Err(error),
                    }
                }
            })
            .await;

        let error = match outcome {
            Ok(intent) => return Ok(intent),
            Err(RetryError::Rejected(error)) => error,
            Err(RetryError::Exhausted(exhausted)) => exhausted
                .last_error
                .with_param("attempts", exhausted.attempts),
        };
        Err(with_cooldown(error, &self.backoff))
    }
}

#[async_trait]
impl PaymentGateway for ResilientGateway {
    async fn start_payment(&self, provider: &str, request: &PaymentRequest) -> ProviderResult {
        self.guarded(provider, "start_payment", HttpMethod::Post, || {
            self.inner.start_payment(provider, request)
        })
        .await
    }

    async fn confirm_payment(&self, provider: &str, params: &ConfirmParams) -> ProviderResult {
        self.guarded(provider, "confirm_payment", HttpMethod::Post, || {
            self.inner.confirm_payment(provider, params)
        })
        .await
    }

    async fn cancel_payment(&self, provider: &str, intent_id: &str) -> ProviderResult {
        self.guarded(provider, "cancel_payment", HttpMethod::Post, || {
            self.inner.cancel_payment(provider, intent_id)
        })
        .await
    }

    async fn get_status(&self, provider: &str, intent_id: &str) -> ProviderResult {
        self.guarded(provider, "get_status", HttpMethod::Get, || {
            self.inner.get_status(provider, intent_id)
        })
        .await
    }

    async fn client_confirm(&self, request: &ClientConfirmRequest) -> ProviderResult {
        self.guarded(&request.provider_id, "client_confirm", HttpMethod::Post, || {
            self.inner.client_confirm(request)
        })
        .await
    }

    async fn finalize(&self, request: &FinalizeRequest) -> ProviderResult {
        self.guarded(&request.provider_id, "finalize", HttpMethod::Post, || {
            self.inner.finalize(request)
        })
        .await
    }

    fn reference_kind(&self, provider: &str) -> ReferenceKind {
        self.inner.reference_kind(provider)
    }
}

/// Normalizes an HTTP failure status into a [`FlowError`].
pub fn error_from_status(status: u16, retry_after: Option<&str>) -> FlowError {
    let code = match status {
        429 => ErrorCode::RateLimited,
        408 | 504 => ErrorCode::ProcessingTimeout,
        500..=599 => ErrorCode::ProviderUnavailable,
        400..=499 => ErrorCode::InvalidRequest,
        _ => ErrorCode::ProviderError,
    };
    let error = FlowError::new(code).with_param(PARAM_HTTP_STATUS, status);
    match retry_after {
        Some(value) => error.with_param(PARAM_RETRY_AFTER, value),
        None => error,
    }
}
