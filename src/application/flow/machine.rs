//! Transition table of the payment flow.
//!
//! The machine is synchronous and side-effect free: it consumes one
//! [`FlowEvent`], mutates its context and returns the [`Effect`]s the runtime
//! must carry out. Provider calls and timers carry a token; results whose token
//! no longer matches the live invocation are dropped, so stale responses can
//! never move the flow.

use super::config::FlowConfig;
use super::context::FlowMachineContext;
use super::events::{Command, FlowEvent, FlowNotice, Operation, SystemEvent, TimerKind};
use super::policy;
use super::state::{FlowSnapshot, FlowState, tags};
use crate::application::fallback::state::{FallbackConfig, FallbackMode, alternative_providers};
use crate::domain::context::{FlowContext, ReferenceKind};
use crate::domain::failure::{ErrorCode, FlowError};
use crate::domain::intent::{IntentRoute, IntentStatus, PaymentIntent};
use crate::domain::ports::{
    ClientConfirmRequest, ConfirmParams, FinalizeRequest, PaymentGateway, ProviderRegistry,
    ProviderResult,
};
use crate::domain::request::{PaymentRequest, ProviderId};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Collaborators and clock reading for one step of the machine.
pub struct MachineEnv<'a> {
    pub config: &'a FlowConfig,
    pub fallback: &'a FallbackConfig,
    pub gateway: &'a dyn PaymentGateway,
    pub registry: &'a dyn ProviderRegistry,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCall {
    Start {
        provider: ProviderId,
        request: PaymentRequest,
    },
    Confirm {
        provider: ProviderId,
        params: ConfirmParams,
    },
    Cancel {
        provider: ProviderId,
        intent_id: String,
    },
    GetStatus {
        provider: ProviderId,
        intent_id: String,
    },
    ClientConfirm(ClientConfirmRequest),
    Finalize(FinalizeRequest),
}

impl ProviderCall {
    pub fn operation(&self) -> Operation {
        match self {
            ProviderCall::Start { .. } => Operation::Start,
            ProviderCall::Confirm { .. } => Operation::Confirm,
            ProviderCall::Cancel { .. } => Operation::Cancel,
            ProviderCall::GetStatus { .. } => Operation::GetStatus,
            ProviderCall::ClientConfirm(_) => Operation::ClientConfirm,
            ProviderCall::Finalize(_) => Operation::Finalize,
        }
    }

    pub async fn execute(self, gateway: &dyn PaymentGateway) -> ProviderResult {
        match self {
            ProviderCall::Start { provider, request } => gateway.start_payment(&provider, &request).await,
            ProviderCall::Confirm { provider, params } => gateway.confirm_payment(&provider, &params).await,
            ProviderCall::Cancel { provider, intent_id } => gateway.cancel_payment(&provider, &intent_id).await,
            ProviderCall::GetStatus { provider, intent_id } => gateway.get_status(&provider, &intent_id).await,
            ProviderCall::ClientConfirm(request) => gateway.client_confirm(&request).await,
            ProviderCall::Finalize(request) => gateway.finalize(&request).await,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Invoke { token: u64, call: ProviderCall },
    Schedule { token: u64, kind: TimerKind, delay: Duration },
    CancelTimer,
    Notify(FlowNotice),
    /// External events to process again, in order, before anything queued.
    Replay(Vec<SystemEvent>),
}

enum Next {
    Ignore,
    Stay,
    Go(FlowState),
}

pub struct FlowMachine {
    state: FlowState,
    ctx: FlowMachineContext,
}

impl FlowMachine {
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            state: FlowState::Idle,
            ctx: FlowMachineContext::new(flow_id),
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn context(&self) -> &FlowMachineContext {
        &self.ctx
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> FlowSnapshot {
        FlowSnapshot {
            state: self.state,
            tags: tags(self.state, &self.ctx, now),
            context: self.ctx.clone(),
        }
    }

    pub fn handle(&mut self, event: FlowEvent, env: &MachineEnv<'_>) -> Vec<Effect> {
        let mut effects = Vec::new();
        match self.route(event, env) {
            Next::Ignore => trace!(flow_id = %self.ctx.flow_id, state = ?self.state, "event ignored"),
            Next::Stay => {}
            Next::Go(target) => self.enter(target, env, &mut effects),
        }
        effects
    }

    fn route(&mut self, event: FlowEvent, env: &MachineEnv<'_>) -> Next {
        match event {
            FlowEvent::Command(Command::Reset) => Next::Go(FlowState::Idle),
            FlowEvent::Command(command) => self.on_command(command, env),
            FlowEvent::System(event) => self.on_system(event, env),
            FlowEvent::Settled { token, operation, result } => {
                if self.ctx.marks.invoke_token != Some(token) {
                    debug!(flow_id = %self.ctx.flow_id, ?operation, token, "stale provider result dropped");
                    return Next::Ignore;
                }
                self.ctx.marks.invoke_token = None;
                self.on_settled(operation, result, env)
            }
            FlowEvent::TimerFired { token, kind } => {
                if self.ctx.marks.timer_token != Some(token) {
                    return Next::Ignore;
                }
                self.ctx.marks.timer_token = None;
                self.on_timer(kind)
            }
            FlowEvent::Shutdown => Next::Ignore,
        }
    }

    /// Exits the current state and runs entry actions until a state settles.
    fn enter(&mut self, mut target: FlowState, env: &MachineEnv<'_>, effects: &mut Vec<Effect>) {
        loop {
            self.exit(effects);
            debug!(flow_id = %self.ctx.flow_id, from = ?self.state, to = ?target, "transition");
            self.state = target;
            match self.on_entry(env, effects) {
                Some(next) => target = next,
                None => break,
            }
        }
    }

    fn exit(&mut self, effects: &mut Vec<Effect>) {
        self.ctx.marks.invoke_token = None;
        if self.ctx.marks.timer_token.take().is_some() {
            effects.push(Effect::CancelTimer);
        }
        if self.state.is_busy() && !self.ctx.marks.deferred.is_empty() {
            effects.push(Effect::Replay(std::mem::take(&mut self.ctx.marks.deferred)));
        }
    }

    fn on_entry(&mut self, env: &MachineEnv<'_>, effects: &mut Vec<Effect>) -> Option<FlowState> {
        match self.state {
            FlowState::Idle => {
                self.ctx.clear();
                None
            }
            FlowState::Starting => {
                let (Some(provider), Some(request)) = (self.ctx.provider_id.clone(), self.ctx.request.clone())
                else {
                    return self.fail(FlowError::invalid_request("missing_request"));
                };
                self.invoke(ProviderCall::Start { provider, request }, effects)
            }
            FlowState::Confirming => {
                let (Some(provider), Some(intent_id)) = (self.ctx.provider_id.clone(), self.ctx.intent_id.clone())
                else {
                    return self.fail(FlowError::invalid_request("missing_intent"));
                };
                let params = ConfirmParams {
                    intent_id,
                    return_url: self.ctx.return_url.clone(),
                };
                self.invoke(ProviderCall::Confirm { provider, params }, effects)
            }
            FlowState::Cancelling => {
                let (Some(provider), Some(intent_id)) = (self.ctx.provider_id.clone(), self.ctx.intent_id.clone())
                else {
                    return self.fail(FlowError::invalid_request("missing_intent"));
                };
                self.invoke(ProviderCall::Cancel { provider, intent_id }, effects)
            }
            FlowState::FetchingStatus => {
                let (Some(provider), Some(intent_id)) = (self.ctx.provider_id.clone(), self.ctx.status_key())
                else {
                    return self.fail(FlowError::invalid_request("missing_intent"));
                };
                self.invoke(ProviderCall::GetStatus { provider, intent_id }, effects)
            }
            FlowState::Reconciling => {
                let (Some(provider), Some(intent_id)) = (self.ctx.provider_id.clone(), self.ctx.status_key())
                else {
                    return self.fail(FlowError::invalid_request("missing_intent"));
                };
                self.invoke(ProviderCall::GetStatus { provider, intent_id }, effects)
            }
            FlowState::ClientConfirming => {
                let action = self.ctx.intent.as_ref().and_then(|intent| intent.next_action.clone());
                let (Some(provider_id), Some(action), Some(context)) =
                    (self.ctx.provider_id.clone(), action, self.ctx.flow_context.clone())
                else {
                    return self.fail(FlowError::invalid_request("missing_next_action"));
                };
                let request = ClientConfirmRequest {
                    provider_id,
                    action,
                    context,
                };
                self.invoke(ProviderCall::ClientConfirm(request), effects)
            }
            FlowState::Finalizing => {
                let (Some(provider_id), Some(context)) = (self.ctx.provider_id.clone(), self.ctx.flow_context.clone())
                else {
                    return self.fail(FlowError::invalid_request("missing_context"));
                };
                self.invoke(ProviderCall::Finalize(FinalizeRequest { provider_id, context }), effects)
            }
            FlowState::Polling => {
                if policy::processing_expired(&self.ctx, env.now) {
                    return self.fail(FlowError::processing_timeout("max_duration"));
                }
                if policy::polling_exhausted(&self.ctx, env.config) {
                    return self.fail(FlowError::processing_timeout("max_attempts"));
                }
                let delay = policy::poll_delay(&self.ctx, env.config);
                self.schedule(TimerKind::Poll, delay, effects)
            }
            FlowState::StatusRetrying => {
                if policy::processing_expired(&self.ctx, env.now) {
                    return self.fail(FlowError::processing_timeout("max_duration"));
                }
                let delay = policy::status_retry_delay(&self.ctx, env.config, env.now);
                debug!(
                    flow_id = %self.ctx.flow_id,
                    retry = self.ctx.status_retry.count,
                    delay_ms = delay.as_millis() as u64,
                    "status check failed, retrying"
                );
                self.schedule(TimerKind::StatusRetry, delay, effects)
            }
            FlowState::RequiresAction => None,
            FlowState::Done => {
                let settled = self.ctx.intent.clone().filter(|intent| intent.status.is_final());
                if let (Some(provider), Some(intent)) = (self.ctx.provider_id.clone(), settled) {
                    info!(flow_id = %self.ctx.flow_id, %provider, status = ?intent.status, "flow completed");
                    effects.push(Effect::Notify(FlowNotice::Completed {
                        flow_id: self.ctx.flow_id.clone(),
                        provider,
                        intent,
                    }));
                }
                None
            }
            FlowState::Failed => {
                if let Some(error) = self.ctx.error.clone() {
                    warn!(flow_id = %self.ctx.flow_id, code = %error.code, "flow failed");
                    effects.push(Effect::Notify(FlowNotice::Failed {
                        flow_id: self.ctx.flow_id.clone(),
                        provider: self.ctx.provider_id.clone().unwrap_or_default(),
                        error,
                        request: self.ctx.request.clone(),
                    }));
                }
                None
            }
            FlowState::FallbackCandidate => {
                let fallback = &mut self.ctx.fallback;
                if !fallback.eligible || fallback.alternatives.is_empty() {
                    info!(flow_id = %self.ctx.flow_id, eligible = fallback.eligible, "no fallback available");
                    return Some(FlowState::Done);
                }
                if fallback.mode == FallbackMode::Auto && fallback.selected_provider_id.is_none() {
                    fallback.selected_provider_id = fallback.alternatives.first().cloned();
                    return Some(FlowState::FallbackConfirming);
                }
                None
            }
            FlowState::FallbackConfirming => self.begin_fallback(env),
        }
    }

    fn on_command(&mut self, command: Command, env: &MachineEnv<'_>) -> Next {
        match (self.state, command) {
            (FlowState::Idle, Command::Start { provider_id, request }) => self.start(provider_id, request, env),
            (FlowState::Idle, Command::Confirm { provider_id, intent_id, return_url }) => {
                self.resume(provider_id, intent_id, return_url, FlowState::Confirming, env)
            }
            (FlowState::Idle, Command::Cancel { provider_id, intent_id }) => {
                self.resume(provider_id, intent_id, None, FlowState::Cancelling, env)
            }
            (
                FlowState::Idle,
                Command::Refresh {
                    provider_id: Some(provider_id),
                    intent_id: Some(intent_id),
                },
            ) => self.resume(provider_id, intent_id, None, FlowState::FetchingStatus, env),
            (FlowState::RequiresAction, Command::Confirm { provider_id, intent_id, return_url }) => {
                if !policy::targets_active(&self.ctx, Some(&provider_id), Some(&intent_id)) {
                    warn!(flow_id = %self.ctx.flow_id, %provider_id, %intent_id, "confirm for inactive intent");
                    return Next::Ignore;
                }
                self.ctx.return_url = return_url
                    .or_else(|| self.ctx.request.as_ref().and_then(|r| r.return_url.clone()));
                let client_side = self.ctx.intent.as_ref().is_some_and(PaymentIntent::needs_client_confirm);
                Next::Go(if client_side {
                    FlowState::ClientConfirming
                } else {
                    FlowState::Confirming
                })
            }
            (
                FlowState::RequiresAction | FlowState::Polling | FlowState::StatusRetrying,
                Command::Cancel { provider_id, intent_id },
            ) => {
                if !policy::targets_active(&self.ctx, Some(&provider_id), Some(&intent_id)) {
                    return Next::Ignore;
                }
                Next::Go(FlowState::Cancelling)
            }
            (
                FlowState::RequiresAction | FlowState::Polling | FlowState::StatusRetrying,
                Command::Refresh { provider_id, intent_id },
            ) => {
                if !policy::targets_active(&self.ctx, provider_id.as_deref(), intent_id.as_deref()) {
                    return Next::Ignore;
                }
                Next::Go(FlowState::FetchingStatus)
            }
            (
                FlowState::Failed,
                Command::FallbackRequested {
                    failed_provider_id,
                    request,
                    mode,
                },
            ) => {
                self.prepare_fallback(failed_provider_id, request, mode, env);
                Next::Go(FlowState::FallbackCandidate)
            }
            (FlowState::FallbackCandidate, Command::FallbackExecute { provider_id, request }) => {
                self.ctx.fallback.selected_provider_id = Some(provider_id);
                self.ctx.fallback.request = Some(request);
                Next::Go(FlowState::FallbackConfirming)
            }
            (FlowState::FallbackCandidate | FlowState::FallbackConfirming, Command::FallbackAbort) => {
                info!(flow_id = %self.ctx.flow_id, "fallback aborted");
                Next::Go(FlowState::Done)
            }
            _ => Next::Ignore,
        }
    }

    fn on_settled(&mut self, operation: Operation, result: ProviderResult, env: &MachineEnv<'_>) -> Next {
        trace!(flow_id = %self.ctx.flow_id, ?operation, ok = result.is_ok(), "provider call settled");
        match (self.state, result) {
            (FlowState::Starting | FlowState::Confirming | FlowState::Cancelling, Ok(intent)) => {
                self.adopt(intent);
                Next::Go(self.branch())
            }
            (FlowState::Starting | FlowState::Confirming | FlowState::Cancelling, Err(error)) => {
                self.ctx.error = Some(error);
                Next::Go(FlowState::Failed)
            }
            (FlowState::FetchingStatus, Ok(intent)) => {
                self.adopt(intent);
                if policy::needs_finalize(&self.ctx) {
                    Next::Go(FlowState::Finalizing)
                } else {
                    Next::Go(self.branch())
                }
            }
            (FlowState::Reconciling, Ok(intent)) => {
                self.adopt(intent);
                Next::Go(self.branch())
            }
            (FlowState::FetchingStatus | FlowState::Reconciling, Err(error)) => self.status_failure(error, env),
            (FlowState::ClientConfirming, Ok(intent)) => {
                self.adopt(intent);
                Next::Go(FlowState::Reconciling)
            }
            (FlowState::ClientConfirming, Err(error)) => {
                self.ctx.client_confirm_retry.count += 1;
                self.ctx.client_confirm_retry.last_error_code = Some(error.code);
                self.ctx.error = Some(error);
                Next::Go(FlowState::Failed)
            }
            (FlowState::Finalizing, Ok(intent)) => {
                self.adopt(intent);
                self.ctx.finalized = true;
                Next::Go(FlowState::Reconciling)
            }
            (FlowState::Finalizing, Err(error)) if error.code == ErrorCode::UnsupportedFinalize => {
                debug!(flow_id = %self.ctx.flow_id, "finalize unsupported, reconciling");
                self.ctx.finalized = true;
                Next::Go(FlowState::Reconciling)
            }
            (FlowState::Finalizing, Err(error)) => {
                self.ctx.finalize_retry.count += 1;
                self.ctx.error = Some(error);
                Next::Go(FlowState::Failed)
            }
            _ => Next::Ignore,
        }
    }

    fn on_timer(&mut self, kind: TimerKind) -> Next {
        match (self.state, kind) {
            (FlowState::Polling, TimerKind::Poll) => {
                self.ctx.polling.attempt += 1;
                Next::Go(FlowState::FetchingStatus)
            }
            (FlowState::StatusRetrying, TimerKind::StatusRetry) => Next::Go(FlowState::FetchingStatus),
            _ => Next::Ignore,
        }
    }

    fn on_system(&mut self, event: SystemEvent, env: &MachineEnv<'_>) -> Next {
        match self.state {
            state if state.is_busy() => {
                debug!(flow_id = %self.ctx.flow_id, kind = event.kind(), ?state, "external event deferred");
                self.ctx.marks.defer(event);
                Next::Stay
            }
            FlowState::RequiresAction
            | FlowState::Polling
            | FlowState::StatusRetrying
            | FlowState::Done
            | FlowState::Failed => self.reconcile_external(event, env),
            _ => Next::Ignore,
        }
    }

    /// Correlates an external event with the flow and decides whether to re-check the provider.
    fn reconcile_external(&mut self, event: SystemEvent, env: &MachineEnv<'_>) -> Next {
        let Some(active) = self.ctx.provider_id.clone() else {
            return Next::Ignore;
        };
        if event.provider_id() != active {
            warn!(
                flow_id = %self.ctx.flow_id,
                provider = event.provider_id(),
                %active,
                "external event for inactive provider ignored"
            );
            return Next::Ignore;
        }

        let terminal = self.state.is_terminal();
        let kind = env.gateway.reference_kind(&active);
        let reference_id = event.reference_id();
        let event_id = event.event_id();

        let outcome = {
            let Some(fc) = self.ctx.flow_context.as_mut() else {
                return Next::Ignore;
            };
            let duplicate = fc.is_duplicate(event_id, reference_id);
            match fc.check_reference(&active, kind, reference_id) {
                Err(mismatch) => Err(mismatch),
                Ok(()) if terminal && duplicate => Ok(None),
                Ok(()) => fc.apply_reference(&active, kind, reference_id).map(|_| {
                    fc.mark_processed(event_id, reference_id);
                    Some(duplicate)
                }),
            }
        };

        match outcome {
            Err(mismatch) => {
                warn!(flow_id = %self.ctx.flow_id, %active, reference_id, "external reference mismatch");
                self.ctx.error = Some(mismatch);
                if self.state == FlowState::Failed {
                    Next::Stay
                } else {
                    Next::Go(FlowState::Failed)
                }
            }
            Ok(None) => {
                debug!(flow_id = %self.ctx.flow_id, reference_id, "duplicate external event ignored");
                Next::Ignore
            }
            Ok(Some(duplicate)) => {
                if !duplicate && policy::needs_finalize(&self.ctx) {
                    Next::Go(FlowState::Finalizing)
                } else {
                    Next::Go(FlowState::Reconciling)
                }
            }
        }
    }

    fn start(&mut self, provider_id: ProviderId, request: PaymentRequest, env: &MachineEnv<'_>) -> Next {
        self.ctx.clear();
        self.ctx.provider_id = Some(provider_id.clone());
        self.ctx.request = Some(request.clone());
        self.ctx.fallback.attempted_providers.push(provider_id.clone());

        let validation = if provider_id.trim().is_empty() {
            Err(FlowError::invalid_request("provider_missing"))
        } else {
            request.validate()
        };
        if let Err(error) = validation {
            self.ctx.error = Some(error);
            return Next::Go(FlowState::Failed);
        }

        let external_reference = request
            .external_reference
            .clone()
            .unwrap_or_else(|| self.ctx.flow_id.clone());
        self.ctx.flow_context = Some(FlowContext::new(
            self.ctx.flow_id.clone(),
            provider_id.clone(),
            external_reference,
            env.now,
            env.config.processing.max_duration(),
        ));
        info!(flow_id = %self.ctx.flow_id, provider = %provider_id, amount = %request.amount, "payment started");
        Next::Go(FlowState::Starting)
    }

    /// Picks up an intent created outside this flow, e.g. before a page reload.
    fn resume(
        &mut self,
        provider_id: ProviderId,
        intent_id: String,
        return_url: Option<String>,
        target: FlowState,
        env: &MachineEnv<'_>,
    ) -> Next {
        if provider_id.trim().is_empty() || intent_id.trim().is_empty() {
            return Next::Ignore;
        }
        self.ctx.clear();
        let mut context = FlowContext::new(
            self.ctx.flow_id.clone(),
            provider_id.clone(),
            self.ctx.flow_id.clone(),
            env.now,
            env.config.processing.max_duration(),
        );
        context
            .provider_refs
            .entry(provider_id.clone())
            .or_default()
            .set(ReferenceKind::IntentId, intent_id.as_str());
        self.ctx.flow_context = Some(context);
        self.ctx.fallback.attempted_providers.push(provider_id.clone());
        self.ctx.provider_id = Some(provider_id);
        self.ctx.intent_id = Some(intent_id);
        self.ctx.return_url = return_url;
        info!(flow_id = %self.ctx.flow_id, provider = ?self.ctx.provider_id, ?target, "resuming existing intent");
        Next::Go(target)
    }

    fn prepare_fallback(
        &mut self,
        failed_provider_id: ProviderId,
        request: PaymentRequest,
        mode: Option<FallbackMode>,
        env: &MachineEnv<'_>,
    ) {
        let eligible = policy::fallback_eligible(&self.ctx, env.fallback);
        let fallback = &mut self.ctx.fallback;
        if !fallback.attempted_providers.contains(&failed_provider_id) {
            fallback.attempted_providers.push(failed_provider_id.clone());
        }
        fallback.alternatives = alternative_providers(
            &env.registry.available_providers(),
            &env.fallback.provider_priority,
            &failed_provider_id,
            &fallback.attempted_providers,
            request.method,
        );
        fallback.eligible = eligible;
        fallback.mode = mode.unwrap_or(env.fallback.mode);
        fallback.failed_provider_id = Some(failed_provider_id);
        fallback.request = Some(request);
        fallback.selected_provider_id = None;
    }

    /// Restarts the payment on the selected alternative, or returns to candidate selection.
    fn begin_fallback(&mut self, env: &MachineEnv<'_>) -> Option<FlowState> {
        let fallback = &mut self.ctx.fallback;
        let Some(request) = fallback.request.clone() else {
            return Some(FlowState::Done);
        };
        let selected = fallback
            .selected_provider_id
            .take()
            .filter(|id| fallback.alternatives.contains(id));
        let Some(provider) = selected else {
            warn!(flow_id = %self.ctx.flow_id, "fallback selection not among alternatives");
            if fallback.mode == FallbackMode::Auto {
                return Some(FlowState::Done);
            }
            return Some(FlowState::FallbackCandidate);
        };

        info!(
            flow_id = %self.ctx.flow_id,
            from = ?fallback.failed_provider_id,
            to = %provider,
            "switching provider"
        );
        fallback.attempted_providers.push(provider.clone());
        fallback.selected_provider_id = Some(provider.clone());
        fallback.alternatives.clear();

        self.ctx.reset_counters();
        self.ctx.intent = None;
        self.ctx.intent_id = None;
        self.ctx.return_url = None;
        self.ctx.error = None;
        self.ctx.finalized = false;
        self.ctx.provider_id = Some(provider.clone());
        self.ctx.request = Some(request.clone());

        let mut context = FlowContext::new(
            self.ctx.flow_id.clone(),
            provider,
            request
                .external_reference
                .clone()
                .unwrap_or_else(|| self.ctx.flow_id.clone()),
            env.now,
            env.config.processing.max_duration(),
        );
        if let Some(previous) = self.ctx.flow_context.take() {
            context.provider_refs = previous.provider_refs;
        }
        self.ctx.flow_context = Some(context);
        Some(FlowState::Starting)
    }

    fn status_failure(&mut self, error: FlowError, env: &MachineEnv<'_>) -> Next {
        self.ctx.status_retry.count += 1;
        self.ctx.resilience.record(&error, env.now);
        let retry = policy::can_retry_status(&self.ctx, env.config);
        self.ctx.error = Some(error);
        if retry {
            Next::Go(FlowState::StatusRetrying)
        } else {
            Next::Go(FlowState::Failed)
        }
    }

    fn adopt(&mut self, intent: PaymentIntent) {
        if intent.status != IntentStatus::Processing {
            self.ctx.reset_counters();
        }
        if let Some(fc) = self.ctx.flow_context.as_mut() {
            fc.record_intent(&intent);
        }
        if self.ctx.intent_id.as_deref() != Some(intent.id.as_str()) {
            self.ctx.finalized = false;
        }
        self.ctx.intent_id = Some(intent.id.clone());
        self.ctx.error = None;
        self.ctx.intent = Some(intent);
    }

    fn branch(&self) -> FlowState {
        match self.ctx.intent.as_ref().map(PaymentIntent::route) {
            Some(IntentRoute::Final) => FlowState::Done,
            Some(IntentRoute::RequiresAction) => FlowState::RequiresAction,
            Some(IntentRoute::Poll) => FlowState::Polling,
            None => FlowState::Failed,
        }
    }

    fn fail(&mut self, error: FlowError) -> Option<FlowState> {
        self.ctx.error = Some(error);
        Some(FlowState::Failed)
    }

    fn invoke(&mut self, call: ProviderCall, effects: &mut Vec<Effect>) -> Option<FlowState> {
        let token = self.ctx.marks.issue();
        self.ctx.marks.invoke_token = Some(token);
        effects.push(Effect::Invoke { token, call });
        None
    }

    fn schedule(&mut self, kind: TimerKind, delay: Duration, effects: &mut Vec<Effect>) -> Option<FlowState> {
        let token = self.ctx.marks.issue();
        self.ctx.marks.timer_token = Some(token);
        effects.push(Effect::Schedule { token, kind, delay });
        None
    }
}
