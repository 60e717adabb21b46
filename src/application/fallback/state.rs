use crate::domain::failure::{ErrorCode, FlowError};
use crate::domain::ports::ProviderDescriptor;
use crate::domain::request::{PaymentMethod, PaymentRequest, ProviderId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    #[default]
    Manual,
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub mode: FallbackMode,
    /// Failed attempts per flow before fallback gives up.
    pub max_attempts: u32,
    pub trigger_error_codes: Vec<ErrorCode>,
    pub user_response_timeout_ms: u64,
    /// Preferred order of alternatives; unlisted providers keep registry order after these.
    pub provider_priority: Vec<ProviderId>,
    pub auto_fallback_delay_ms: u64,
    pub max_auto_fallbacks: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: FallbackMode::Manual,
            max_attempts: 3,
            trigger_error_codes: vec![
                ErrorCode::ProviderError,
                ErrorCode::ProviderUnavailable,
                ErrorCode::ProcessingTimeout,
                ErrorCode::CircuitOpen,
                ErrorCode::RateLimited,
            ],
            user_response_timeout_ms: 30_000,
            provider_priority: Vec::new(),
            auto_fallback_delay_ms: 2_000,
            max_auto_fallbacks: 1,
        }
    }
}

impl FallbackConfig {
    pub fn is_trigger(&self, code: ErrorCode) -> bool {
        self.enabled && self.trigger_error_codes.contains(&code)
    }

    pub fn user_response_timeout(&self) -> Duration {
        Duration::from_millis(self.user_response_timeout_ms)
    }

    pub fn auto_fallback_delay(&self) -> Duration {
        Duration::from_millis(self.auto_fallback_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStatus {
    #[default]
    Idle,
    Pending,
    Executing,
    AutoExecuting,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub provider: ProviderId,
    pub error: FlowError,
    pub was_auto_fallback: bool,
    pub timestamp: DateTime<Utc>,
}

/// An offer to switch providers, awaiting a response or an automatic execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingFallback {
    pub event_id: String,
    pub failed_provider: ProviderId,
    pub alternative_providers: Vec<ProviderId>,
    pub original_request: PaymentRequest,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackState {
    pub status: FallbackStatus,
    pub pending_event: Option<PendingFallback>,
    pub failed_attempts: Vec<FailedAttempt>,
    pub current_provider: Option<ProviderId>,
    pub is_auto_fallback: bool,
    pub auto_fallback_count: u32,
}

impl FallbackState {
    pub fn has_failed(&self, provider: &str) -> bool {
        self.failed_attempts.iter().any(|a| a.provider == provider)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackResponse {
    pub event_id: String,
    pub accepted: bool,
    #[serde(default)]
    pub selected_provider: Option<ProviderId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Declined,
    Expired,
    InvalidSelection,
}

/// Notifications emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FallbackEvent {
    Available {
        flow_id: String,
        event: PendingFallback,
        response_ttl_ms: u64,
    },
    AutoStarted {
        flow_id: String,
        event_id: String,
        from_provider: ProviderId,
        to_provider: ProviderId,
    },
    Execute {
        flow_id: String,
        provider: ProviderId,
        request: PaymentRequest,
        is_auto: bool,
    },
    Cancelled {
        flow_id: String,
        event_id: String,
        reason: CancelReason,
    },
    Exhausted {
        flow_id: String,
        attempts: usize,
    },
    Completed {
        flow_id: String,
        provider: ProviderId,
    },
}

impl FallbackEvent {
    pub fn flow_id(&self) -> &str {
        match self {
            FallbackEvent::Available { flow_id, .. }
            | FallbackEvent::AutoStarted { flow_id, .. }
            | FallbackEvent::Execute { flow_id, .. }
            | FallbackEvent::Cancelled { flow_id, .. }
            | FallbackEvent::Exhausted { flow_id, .. }
            | FallbackEvent::Completed { flow_id, .. } => flow_id,
        }
    }
}

/// Providers a failed payment may move to, in priority order.
///
/// Excludes disabled providers, every provider in `excluded`, the failed
/// provider itself and providers that cannot take `method`.
pub fn alternative_providers(
    providers: &[ProviderDescriptor],
    priority: &[ProviderId],
    failed_provider: &str,
    excluded: &[ProviderId],
    method: PaymentMethod,
) -> Vec<ProviderId> {
    let mut candidates: Vec<&ProviderDescriptor> = providers
        .iter()
        .filter(|p| p.enabled)
        .filter(|p| p.id != failed_provider)
        .filter(|p| !excluded.contains(&p.id))
        .filter(|p| p.supports(method))
        .collect();

    candidates.sort_by_key(|p| {
        priority
            .iter()
            .position(|id| *id == p.id)
            .unwrap_or(usize::MAX)
    });
    candidates.into_iter().map(|p| p.id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers() -> Vec<ProviderDescriptor> {
        vec![
            ProviderDescriptor::new("stripe", vec![PaymentMethod::Card, PaymentMethod::Wallet]),
            ProviderDescriptor::new("adyen", vec![PaymentMethod::Card]),
            ProviderDescriptor::new("paypal", vec![PaymentMethod::Card, PaymentMethod::Wallet]),
            ProviderDescriptor::new("mercadopago", vec![PaymentMethod::Pix]),
        ]
    }

    #[test]
    fn test_alternatives_respect_priority_and_method() {
        let alts = alternative_providers(
            &providers(),
            &["paypal".to_string()],
            "stripe",
            &[],
            PaymentMethod::Card,
        );
        assert_eq!(alts, vec!["paypal".to_string(), "adyen".to_string()]);
    }

    #[test]
    fn test_alternatives_exclude_failed_history() {
        let alts = alternative_providers(
            &providers(),
            &[],
            "paypal",
            &["stripe".to_string()],
            PaymentMethod::Wallet,
        );
        assert!(alts.is_empty());
    }

    #[test]
    fn test_disabled_providers_are_skipped() {
        let mut list = providers();
        list[1].enabled = false;
        let alts = alternative_providers(&list, &[], "stripe", &[], PaymentMethod::Card);
        assert_eq!(alts, vec!["paypal".to_string()]);
    }

    #[test]
    fn test_trigger_requires_enabled() {
        let mut config = FallbackConfig::default();
        assert!(config.is_trigger(ErrorCode::ProviderUnavailable));
        assert!(!config.is_trigger(ErrorCode::InvalidRequest));
        config.enabled = false;
        assert!(!config.is_trigger(ErrorCode::ProviderUnavailable));
    }
}
