use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Parameter carrying the upstream HTTP status of a provider failure.
pub const PARAM_HTTP_STATUS: &str = "http_status";
/// Parameter carrying a raw `Retry-After` header value.
pub const PARAM_RETRY_AFTER: &str = "retry_after";
/// Parameter carrying a cooldown hint in milliseconds.
pub const PARAM_RETRY_AFTER_MS: &str = "retry_after_ms";

/// Normalized failure taxonomy shared by the flow engine, the fallback
/// orchestrator and the provider adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    ProviderError,
    ProviderUnavailable,
    ReturnCorrelationMismatch,
    ProcessingTimeout,
    UnsupportedClientConfirm,
    UnsupportedFinalize,
    RateLimited,
    CircuitOpen,
    FallbackUnavailable,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::ProviderError => "provider_error",
            ErrorCode::ProviderUnavailable => "provider_unavailable",
            ErrorCode::ReturnCorrelationMismatch => "return_correlation_mismatch",
            ErrorCode::ProcessingTimeout => "processing_timeout",
            ErrorCode::UnsupportedClientConfirm => "unsupported_client_confirm",
            ErrorCode::UnsupportedFinalize => "unsupported_finalize",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::CircuitOpen => "circuit_open",
            ErrorCode::FallbackUnavailable => "fallback_unavailable",
            ErrorCode::Cancelled => "cancelled",
        }
    }

    /// Localization key used by presentation layers.
    pub fn message_key(&self) -> String {
        format!("payment.errors.{}", self.as_str())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminal or transient failure in presentation-ready form.
///
/// Carries enough context (`code`, `message_key`, `params`) for a UI to render
/// it and for the fallback orchestrator to judge eligibility without
/// re-deriving anything from the raw provider response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code} ({message_key})")]
pub struct FlowError {
    pub code: ErrorCode,
    pub message_key: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl FlowError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message_key: code.message_key(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Upstream HTTP status, when the failure came from a transport call.
    pub fn http_status(&self) -> Option<u16> {
        self.param(PARAM_HTTP_STATUS).and_then(|v| v.parse().ok())
    }

    /// Cooldown hint attached by resilience layers.
    pub fn retry_after(&self) -> Option<Duration> {
        self.param(PARAM_RETRY_AFTER_MS)
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
    }

    pub fn invalid_request(reason: &str) -> Self {
        Self::new(ErrorCode::InvalidRequest).with_param("reason", reason)
    }

    pub fn correlation_mismatch(expected: &str, received: &str) -> Self {
        Self::new(ErrorCode::ReturnCorrelationMismatch)
            .with_param("expected", expected)
            .with_param("received", received)
    }

    pub fn processing_timeout(reason: &str) -> Self {
        Self::new(ErrorCode::ProcessingTimeout).with_param("reason", reason)
    }
}

impl From<ErrorCode> for FlowError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}
