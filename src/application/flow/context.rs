use super::events::SystemEvent;
use crate::application::fallback::state::FallbackMode;
use crate::domain::context::FlowContext;
use crate::domain::failure::{ErrorCode, FlowError};
use crate::domain::intent::PaymentIntent;
use crate::domain::request::{PaymentRequest, ProviderId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FallbackContext {
    pub eligible: bool,
    pub mode: FallbackMode,
    pub failed_provider_id: Option<ProviderId>,
    pub request: Option<PaymentRequest>,
    pub selected_provider_id: Option<ProviderId>,
    pub alternatives: Vec<ProviderId>,
    /// Every provider tried in this flow, the active one included.
    pub attempted_providers: Vec<ProviderId>,
}

/// Cooldowns reported by resilience layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResilienceContext {
    pub circuit_cooldown_ms: Option<u64>,
    pub circuit_opened_at: Option<DateTime<Utc>>,
    pub rate_limit_cooldown_ms: Option<u64>,
    pub rate_limit_opened_at: Option<DateTime<Utc>>,
}

impl ResilienceContext {
    /// Remembers the cooldown carried by a `circuit_open` or `rate_limited` error.
    pub fn record(&mut self, error: &FlowError, now: DateTime<Utc>) {
        let cooldown = error.retry_after().map(|d| d.as_millis() as u64);
        match error.code {
            ErrorCode::CircuitOpen => {
                self.circuit_cooldown_ms = cooldown;
                self.circuit_opened_at = Some(now);
            }
            ErrorCode::RateLimited => {
                self.rate_limit_cooldown_ms = cooldown;
                self.rate_limit_opened_at = Some(now);
            }
            _ => {}
        }
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let circuit = remaining(self.circuit_opened_at, self.circuit_cooldown_ms, now);
        let rate_limit = remaining(self.rate_limit_opened_at, self.rate_limit_cooldown_ms, now);
        circuit.max(rate_limit)
    }

    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        !self.remaining(now).is_zero()
    }
}

fn remaining(opened_at: Option<DateTime<Utc>>, cooldown_ms: Option<u64>, now: DateTime<Utc>) -> Duration {
    let (Some(opened_at), Some(cooldown_ms)) = (opened_at, cooldown_ms) else {
        return Duration::ZERO;
    };
    let until = opened_at + chrono::Duration::milliseconds(cooldown_ms as i64);
    (until - now).to_std().unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientConfirmRetry {
    pub count: u32,
    pub last_error_code: Option<ErrorCode>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FinalizeRetry {
    pub count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollingProgress {
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusRetryProgress {
    pub count: u32,
}

/// Bookkeeping owned by the runtime. Never serialized.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RuntimeMarks {
    pub invoke_token: Option<u64>,
    pub timer_token: Option<u64>,
    next_token: u64,
    pub deferred: Vec<SystemEvent>,
}

impl RuntimeMarks {
    pub fn issue(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    /// Latest event per kind wins, so at most one event per kind is held.
    pub fn defer(&mut self, event: SystemEvent) {
        self.deferred.retain(|queued| queued.kind() != event.kind());
        self.deferred.push(event);
    }
}

/// Everything the flow machine knows about the payment in progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowMachineContext {
    pub flow_id: String,
    pub provider_id: Option<ProviderId>,
    pub request: Option<PaymentRequest>,
    pub flow_context: Option<FlowContext>,
    pub intent: Option<PaymentIntent>,
    pub intent_id: Option<String>,
    pub return_url: Option<String>,
    pub error: Option<FlowError>,
    /// Finalize already ran (or was unsupported) for the current intent.
    pub finalized: bool,
    pub fallback: FallbackContext,
    pub resilience: ResilienceContext,
    pub client_confirm_retry: ClientConfirmRetry,
    pub finalize_retry: FinalizeRetry,
    pub polling: PollingProgress,
    pub status_retry: StatusRetryProgress,
    #[serde(skip)]
    pub(crate) marks: RuntimeMarks,
}

impl FlowMachineContext {
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            provider_id: None,
            request: None,
            flow_context: None,
            intent: None,
            intent_id: None,
            return_url: None,
            error: None,
            finalized: false,
            fallback: FallbackContext::default(),
            resilience: ResilienceContext::default(),
            client_confirm_retry: ClientConfirmRetry::default(),
            finalize_retry: FinalizeRetry::default(),
            polling: PollingProgress::default(),
            status_retry: StatusRetryProgress::default(),
            marks: RuntimeMarks::default(),
        }
    }

    /// Back to a pristine context. Token numbering keeps increasing.
    pub fn clear(&mut self) {
        let next_token = self.marks.next_token;
        *self = Self::new(std::mem::take(&mut self.flow_id));
        self.marks.next_token = next_token;
    }

    pub fn reset_counters(&mut self) {
        self.client_confirm_retry = ClientConfirmRetry::default();
        self.finalize_retry = FinalizeRetry::default();
        self.polling = PollingProgress::default();
        self.status_retry = StatusRetryProgress::default();
    }

    /// Intent id to query, preferring the provider's canonical status key.
    pub fn status_key(&self) -> Option<String> {
        let provider = self.provider_id.as_deref()?;
        self.flow_context
            .as_ref()
            .and_then(|fc| fc.status_key(provider))
            .map(str::to_string)
            .or_else(|| self.intent_id.clone())
    }

    pub fn deferred(&self) -> &[SystemEvent] {
        &self.marks.deferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::failure::PARAM_RETRY_AFTER_MS;

    #[test]
    fn test_cooldown_uses_longest_window() {
        let now = Utc::now();
        let mut resilience = ResilienceContext::default();
        resilience.record(
            &FlowError::new(ErrorCode::RateLimited).with_param(PARAM_RETRY_AFTER_MS, 2_000),
            now,
        );
        resilience.record(
            &FlowError::new(ErrorCode::CircuitOpen).with_param(PARAM_RETRY_AFTER_MS, 500),
            now,
        );
        assert_eq!(resilience.remaining(now), Duration::from_secs(2));
        assert!(!resilience.is_cooling_down(now + chrono::Duration::seconds(3)));
    }

    #[test]
    fn test_other_errors_leave_cooldowns_alone() {
        let mut resilience = ResilienceContext::default();
        resilience.record(&FlowError::new(ErrorCode::ProviderError), Utc::now());
        assert_eq!(resilience, ResilienceContext::default());
    }

    #[test]
    fn test_defer_keeps_latest_per_kind() {
        let mut marks = RuntimeMarks::default();
        marks.defer(SystemEvent::RedirectReturned {
            provider_id: "stripe".into(),
            reference_id: "pi_old".into(),
        });
        marks.defer(SystemEvent::ExternalStatusUpdated {
            provider_id: "stripe".into(),
            reference_id: "pi_1".into(),
            event_id: None,
        });
        marks.defer(SystemEvent::RedirectReturned {
            provider_id: "stripe".into(),
            reference_id: "pi_1".into(),
        });
        assert_eq!(marks.deferred.len(), 2);
        assert_eq!(marks.deferred[1].reference_id(), "pi_1");
        assert_eq!(marks.deferred[1].kind(), "redirect_returned");
    }

    #[test]
    fn test_clear_keeps_flow_id_and_tokens() {
        let mut ctx = FlowMachineContext::new("flow-9");
        let first = ctx.marks.issue();
        ctx.provider_id = Some("stripe".into());
        ctx.polling.attempt = 4;
        ctx.clear();
        assert_eq!(ctx.flow_id, "flow-9");
        assert_eq!(ctx.provider_id, None);
        assert_eq!(ctx.polling.attempt, 0);
        assert!(ctx.marks.issue() > first);
    }
}
