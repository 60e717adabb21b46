//! Guards consulted by the transition table. Pure functions over the context.

use super::config::FlowConfig;
use super::context::FlowMachineContext;
use crate::application::fallback::state::FallbackConfig;
use crate::resilience::backoff::compute_delay;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// The flow outlived `processing.max_duration_ms`.
pub fn processing_expired(ctx: &FlowMachineContext, now: DateTime<Utc>) -> bool {
    ctx.flow_context.as_ref().is_some_and(|fc| fc.is_expired(now))
}

pub fn polling_exhausted(ctx: &FlowMachineContext, config: &FlowConfig) -> bool {
    ctx.polling.attempt >= config.polling.max_attempts
}

/// Evaluated after `status_retry.count` was incremented for the failure at hand.
pub fn can_retry_status(ctx: &FlowMachineContext, config: &FlowConfig) -> bool {
    ctx.status_retry.count <= config.status_retry.max_retries
}

pub fn needs_finalize(ctx: &FlowMachineContext) -> bool {
    !ctx.finalized && ctx.intent.as_ref().is_some_and(|intent| intent.finalize_required)
}

pub fn fallback_eligible(ctx: &FlowMachineContext, config: &FallbackConfig) -> bool {
    ctx.error.as_ref().is_some_and(|err| config.is_trigger(err.code))
}

/// Delay before the next status poll.
pub fn poll_delay(ctx: &FlowMachineContext, config: &FlowConfig) -> Duration {
    compute_delay(ctx.polling.attempt + 1, &config.polling_backoff())
}

/// Backoff before the next status retry, stretched to cover any active cooldown.
pub fn status_retry_delay(ctx: &FlowMachineContext, config: &FlowConfig, now: DateTime<Utc>) -> Duration {
    let backoff = compute_delay(ctx.status_retry.count, &config.status_retry_backoff());
    backoff.max(ctx.resilience.remaining(now))
}

/// Command targets the active provider and, when given, the active intent.
pub fn targets_active(ctx: &FlowMachineContext, provider_id: Option<&str>, intent_id: Option<&str>) -> bool {
    let provider_ok = provider_id.is_none_or(|p| ctx.provider_id.as_deref() == Some(p));
    let intent_ok = intent_id.is_none_or(|id| ctx.intent_id.as_deref() == Some(id));
    provider_ok && intent_ok
}
