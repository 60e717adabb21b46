use super::state::{
    CancelReason, FailedAttempt, FallbackConfig, FallbackEvent, FallbackMode, FallbackResponse,
    FallbackState, FallbackStatus, PendingFallback, alternative_providers,
};
use crate::domain::failure::FlowError;
use crate::domain::ports::SharedRegistry;
use crate::domain::request::{PaymentRequest, ProviderId};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

#[derive(Default)]
struct FlowSlot {
    state: FallbackState,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every transition; timers carry the value they were armed with.
    generation: u64,
    pending_since: Option<Instant>,
}

impl FlowSlot {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn bump(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

struct Shared {
    config: FallbackConfig,
    registry: SharedRegistry,
    flows: Mutex<HashMap<String, FlowSlot>>,
    events: broadcast::Sender<FallbackEvent>,
}

impl Shared {
    fn flows(&self) -> MutexGuard<'_, HashMap<String, FlowSlot>> {
        self.flows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: FallbackEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Tracks failed provider attempts per flow and proposes or executes a switch
/// to an alternative provider.
///
/// All timers (response TTL, auto-fallback delay, post-failure reset) are
/// spawned on the ambient tokio runtime and cancelled whenever a newer
/// transition supersedes them.
#[derive(Clone)]
pub struct FallbackOrchestrator {
    shared: Arc<Shared>,
}

impl FallbackOrchestrator {
    pub fn new(config: FallbackConfig, registry: SharedRegistry) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                flows: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FallbackEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self, flow_id: &str) -> FallbackState {
        self.shared
            .flows()
            .get(flow_id)
            .map(|slot| slot.state.clone())
            .unwrap_or_default()
    }

    /// Records a failed attempt and offers (or schedules) a fallback.
    ///
    /// Returns `false` without touching any state when fallback is disabled
    /// or the error code is not a trigger.
    pub fn report_failure(
        &self,
        flow_id: &str,
        provider: &str,
        error: &FlowError,
        request: &PaymentRequest,
        was_auto_fallback: bool,
    ) -> bool {
        let config = &self.shared.config;
        if !config.is_trigger(error.code) {
            debug!(flow_id, provider, code = %error.code, "failure not eligible for fallback");
            return false;
        }

        let mut flows = self.shared.flows();
        let slot = flows.entry(flow_id.to_string()).or_default();
        slot.cancel_timer();
        slot.state.pending_event = None;
        slot.state.failed_attempts.push(FailedAttempt {
            provider: provider.to_string(),
            error: error.clone(),
            was_auto_fallback,
            timestamp: Utc::now(),
        });

        if slot.state.failed_attempts.len() as u32 >= config.max_attempts {
            self.terminate(flow_id, slot);
            return true;
        }

        let excluded: Vec<ProviderId> = slot
            .state
            .failed_attempts
            .iter()
            .map(|a| a.provider.clone())
            .collect();
        let alternatives = alternative_providers(
            &self.shared.registry.available_providers(),
            &config.provider_priority,
            provider,
            &excluded,
            request.method,
        );
        if alternatives.is_empty() {
            self.terminate(flow_id, slot);
            return true;
        }

        let event = PendingFallback {
            event_id: Uuid::new_v4().to_string(),
            failed_provider: provider.to_string(),
            alternative_providers: alternatives,
            original_request: request.clone(),
            timestamp: Utc::now(),
        };
        let generation = slot.bump();
        slot.pending_since = Some(Instant::now());
        slot.state.pending_event = Some(event.clone());

        let auto = config.mode == FallbackMode::Auto
            && slot.state.auto_fallback_count < config.max_auto_fallbacks;
        if auto {
            slot.state.status = FallbackStatus::AutoExecuting;
            slot.state.is_auto_fallback = true;
            slot.timer = Some(self.arm_auto_execution(flow_id, generation));
            info!(flow_id, from = provider, to = %event.alternative_providers[0], "automatic fallback scheduled");
            self.shared.emit(FallbackEvent::AutoStarted {
                flow_id: flow_id.to_string(),
                event_id: event.event_id.clone(),
                from_provider: provider.to_string(),
                to_provider: event.alternative_providers[0].clone(),
            });
        } else {
            slot.state.status = FallbackStatus::Pending;
            slot.state.is_auto_fallback = false;
            slot.timer = Some(self.arm_expiry(flow_id, generation));
            info!(flow_id, provider, alternatives = ?event.alternative_providers, "fallback available");
            self.shared.emit(FallbackEvent::Available {
                flow_id: flow_id.to_string(),
                event,
                response_ttl_ms: config.user_response_timeout_ms,
            });
        }
        true
    }

    /// Applies the user's answer to a pending offer. Returns whether an
    /// execution was issued.
    pub fn respond_to_fallback(&self, flow_id: &str, response: &FallbackResponse) -> bool {
        let mut flows = self.shared.flows();
        let Some(slot) = flows.get_mut(flow_id) else {
            return false;
        };
        let Some(pending) = slot.state.pending_event.clone() else {
            return false;
        };
        if pending.event_id != response.event_id || slot.state.status != FallbackStatus::Pending {
            debug!(flow_id, event_id = %response.event_id, "ignoring response to stale fallback offer");
            return false;
        }

        let expired = slot
            .pending_since
            .is_some_and(|since| since.elapsed() >= self.shared.config.user_response_timeout());
        let selected = response
            .selected_provider
            .clone()
            .or_else(|| pending.alternative_providers.first().cloned());

        let rejection = if expired {
            Some(CancelReason::Expired)
        } else if !response.accepted {
            Some(CancelReason::Declined)
        } else if !selected
            .as_ref()
            .is_some_and(|p| pending.alternative_providers.contains(p))
        {
            Some(CancelReason::InvalidSelection)
        } else {
            None
        };

        if let Some(reason) = rejection {
            self.cancel(flow_id, slot, &pending.event_id, reason);
            return false;
        }
        let Some(provider) = selected else {
            return false;
        };

        slot.cancel_timer();
        slot.bump();
        slot.pending_since = None;
        slot.state.pending_event = None;
        slot.state.status = FallbackStatus::Executing;
        slot.state.current_provider = Some(provider.clone());
        info!(flow_id, provider = %provider, "executing fallback");
        self.shared.emit(FallbackEvent::Execute {
            flow_id: flow_id.to_string(),
            provider,
            request: pending.original_request,
            is_auto: false,
        });
        true
    }

    pub fn notify_success(&self, flow_id: &str, provider: &str) {
        let mut flows = self.shared.flows();
        let Some(slot) = flows.get_mut(flow_id) else {
            return;
        };
        slot.cancel_timer();
        slot.bump();
        slot.pending_since = None;
        slot.state.pending_event = None;
        slot.state.status = FallbackStatus::Completed;
        slot.state.current_provider = Some(provider.to_string());
        self.shared.emit(FallbackEvent::Completed {
            flow_id: flow_id.to_string(),
            provider: provider.to_string(),
        });
    }

    /// Closes the loop on an executed fallback that failed. With
    /// `continue_chain` the failure is re-reported to try the next provider.
    pub fn notify_failure(
        &self,
        flow_id: &str,
        provider: &str,
        error: &FlowError,
        request: &PaymentRequest,
        continue_chain: bool,
    ) -> bool {
        let was_auto = {
            let mut flows = self.shared.flows();
            let Some(slot) = flows.get_mut(flow_id) else {
                return false;
            };
            if !continue_chain {
                slot.state.failed_attempts.push(FailedAttempt {
                    provider: provider.to_string(),
                    error: error.clone(),
                    was_auto_fallback: slot.state.is_auto_fallback,
                    timestamp: Utc::now(),
                });
                self.terminate(flow_id, slot);
                return true;
            }
            slot.state.is_auto_fallback
        };
        self.report_failure(flow_id, provider, error, request, was_auto)
    }

    /// Cancels pending timers, then drops all state for the flow.
    pub fn reset(&self, flow_id: &str) {
        if let Some(mut slot) = self.shared.flows().remove(flow_id) {
            slot.cancel_timer();
        }
    }

    pub fn reset_all(&self) {
        for (_, mut slot) in self.shared.flows().drain() {
            slot.cancel_timer();
        }
    }

    fn cancel(&self, flow_id: &str, slot: &mut FlowSlot, event_id: &str, reason: CancelReason) {
        slot.cancel_timer();
        slot.bump();
        slot.pending_since = None;
        slot.state.pending_event = None;
        slot.state.status = FallbackStatus::Cancelled;
        info!(flow_id, event_id, ?reason, "fallback cancelled");
        self.shared.emit(FallbackEvent::Cancelled {
            flow_id: flow_id.to_string(),
            event_id: event_id.to_string(),
            reason,
        });
    }

    /// Marks the chain failed and resets the flow to idle on the next tick.
    fn terminate(&self, flow_id: &str, slot: &mut FlowSlot) {
        slot.cancel_timer();
        let generation = slot.bump();
        slot.pending_since = None;
        slot.state.pending_event = None;
        slot.state.status = FallbackStatus::Failed;
        let attempts = slot.state.failed_attempts.len();
        warn!(flow_id, attempts, "fallback chain exhausted");
        self.shared.emit(FallbackEvent::Exhausted {
            flow_id: flow_id.to_string(),
            attempts,
        });

        let shared = self.shared.clone();
        let flow_id = flow_id.to_string();
        slot.timer = Some(tokio::spawn(async move {
            tokio::task::yield_now().await;
            let mut flows = shared.flows();
            if flows.get(&flow_id).is_some_and(|slot| {
                slot.generation == generation && slot.state.status == FallbackStatus::Failed
            }) {
                flows.remove(&flow_id);
                debug!(flow_id = %flow_id, "fallback state reset to idle");
            }
        }));
    }

    fn arm_expiry(&self, flow_id: &str, generation: u64) -> JoinHandle<()> {
        let ttl = self.shared.config.user_response_timeout();
        let orchestrator = self.clone();
        let flow_id = flow_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut flows = orchestrator.shared.flows();
            let Some(slot) = flows.get_mut(&flow_id) else {
                return;
            };
            if slot.generation != generation || slot.state.status != FallbackStatus::Pending {
                return;
            }
            let event_id = slot
                .state
                .pending_event
                .as_ref()
                .map(|e| e.event_id.clone())
                .unwrap_or_default();
            // Detach our own handle before `cancel` aborts it.
            slot.timer = None;
            orchestrator.cancel(&flow_id, slot, &event_id, CancelReason::Expired);
        })
    }

    fn arm_auto_execution(&self, flow_id: &str, generation: u64) -> JoinHandle<()> {
        let delay: Duration = self.shared.config.auto_fallback_delay();
        let shared = self.shared.clone();
        let flow_id = flow_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut flows = shared.flows();
            let Some(slot) = flows.get_mut(&flow_id) else {
                return;
            };
            if slot.generation != generation || slot.state.status != FallbackStatus::AutoExecuting {
                return;
            }
            let Some(pending) = slot.state.pending_event.take() else {
                return;
            };
            let Some(provider) = pending.alternative_providers.first().cloned() else {
                return;
            };
            slot.timer = None;
            slot.bump();
            slot.pending_since = None;
            slot.state.auto_fallback_count += 1;
            slot.state.current_provider = Some(provider.clone());
            info!(flow_id = %flow_id, provider = %provider, "executing automatic fallback");
            shared.emit(FallbackEvent::Execute {
                flow_id: flow_id.clone(),
                provider,
                request: pending.original_request,
                is_auto: true,
            });
        })
    }
}
