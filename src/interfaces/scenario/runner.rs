use super::model::{Scenario, Step};
use crate::application::fallback::state::{FallbackEvent, FallbackResponse, FallbackState};
use crate::application::fallback::{FallbackOrchestrator, attach};
use crate::application::flow::events::FlowNotice;
use crate::application::flow::runtime::{FlowDeps, FlowHandle};
use crate::application::flow::state::FlowSnapshot;
use crate::config::EngineConfig;
use crate::domain::ports::{SharedGateway, SharedRegistry};
use crate::error::{PaymentError, Result};
use crate::infrastructure::in_memory::{InMemoryRegistry, ScriptedGateway};
use crate::infrastructure::resilient::ResilientGateway;
use crate::resilience::circuit_breaker::CircuitBreaker;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayCall {
    pub provider: String,
    pub operation: String,
}

/// Outcome of a scenario run, printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub flow_id: String,
    pub snapshot: FlowSnapshot,
    pub notices: Vec<FlowNotice>,
    pub fallback: FallbackState,
    pub fallback_events: Vec<FallbackEvent>,
    pub calls: Vec<GatewayCall>,
}

/// Runs the scenario's timeline against a fresh flow wired to in-memory adapters.
pub async fn run_scenario(scenario: Scenario, config: &EngineConfig) -> Result<ScenarioReport> {
    let registry = Arc::new(InMemoryRegistry::new(
        scenario.providers.iter().map(|p| p.descriptor.clone()).collect(),
    ));
    let scripted = Arc::new(ScriptedGateway::new());
    scripted.set_latency(Duration::from_millis(scenario.latency_ms));
    for provider in &scenario.providers {
        let id = provider.descriptor.id.as_str();
        if let Some(kind) = provider.reference_kind {
            scripted.set_reference_kind(id, kind);
        }
        for (operation, outcomes) in &provider.responses {
            let operation = super::operation(operation).ok_or_else(|| {
                PaymentError::ValidationError(format!("unknown gateway operation '{operation}'"))
            })?;
            for outcome in outcomes {
                scripted.push(id, operation, outcome.clone().into());
            }
        }
    }

    let shared_registry: SharedRegistry = registry;
    let gateway: SharedGateway = if scenario.resilient {
        Arc::new(ResilientGateway::new(
            scripted.clone(),
            shared_registry.clone(),
            Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())),
            config.backoff.clone(),
        ))
    } else {
        scripted.clone()
    };
    let orchestrator = FallbackOrchestrator::new(config.fallback.clone(), shared_registry.clone());
    let deps = FlowDeps {
        gateway,
        registry: shared_registry,
        config: config.flow.clone(),
        fallback: config.fallback.clone(),
    };
    let flow = match scenario.flow_id {
        Some(id) => FlowHandle::spawn_with_id(id, deps),
        None => FlowHandle::spawn(deps),
    };
    let mut notices = flow.notices();
    let mut decisions = orchestrator.subscribe();
    let bridge = scenario
        .fallback
        .then(|| attach(flow.clone(), orchestrator.clone()));

    info!(flow_id = flow.flow_id(), steps = scenario.steps.len(), "running scenario");
    let outcome = run_steps(&flow, &orchestrator, scenario.steps).await;

    let snapshot = flow.snapshot();
    let fallback = orchestrator.state(flow.flow_id());
    flow.shutdown();
    if let Some(bridge) = bridge {
        bridge.abort();
    }
    outcome?;

    Ok(ScenarioReport {
        flow_id: flow.flow_id().to_string(),
        snapshot,
        notices: drain(&mut notices),
        fallback,
        fallback_events: drain(&mut decisions)
            .into_iter()
            .filter(|event| event.flow_id() == flow.flow_id())
            .collect(),
        calls: scripted
            .call_log()
            .into_iter()
            .map(|(provider, operation)| GatewayCall {
                provider,
                operation: operation.to_string(),
            })
            .collect(),
    })
}

async fn run_steps(flow: &FlowHandle, orchestrator: &FallbackOrchestrator, steps: Vec<Step>) -> Result<()> {
    for (index, step) in steps.into_iter().enumerate() {
        debug!(index, ?step, "scenario step");
        match step {
            Step::Command(command) => flow.send(command)?,
            Step::Event(event) => flow.notify(event)?,
            Step::Sleep { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
            Step::WaitFor { state, timeout_ms } => {
                tokio::time::timeout(Duration::from_millis(timeout_ms), flow.wait_for_state(state))
                    .await
                    .map_err(|_| {
                        PaymentError::ScenarioError(format!(
                            "step {index}: timed out after {timeout_ms}ms waiting for {state:?}, flow is {:?}",
                            flow.snapshot().state
                        ))
                    })??;
            }
            Step::RespondFallback {
                accepted,
                selected_provider,
            } => {
                let pending = orchestrator
                    .state(flow.flow_id())
                    .pending_event
                    .ok_or_else(|| PaymentError::ScenarioError(format!("step {index}: no pending fallback offer")))?;
                orchestrator.respond_to_fallback(
                    flow.flow_id(),
                    &FallbackResponse {
                        event_id: pending.event_id,
                        accepted,
                        selected_provider,
                    },
                );
            }
        }
    }
    Ok(())
}

fn drain<T: Clone>(receiver: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(item) => items.push(item),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::flow::state::FlowState;
    use crate::interfaces::scenario::reader::ScenarioReader;

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.flow.jitter_factor = 0.0;
        config.flow.polling.base_delay_ms = 10;
        config.flow.polling.max_delay_ms = 20;
        config.flow.status_retry.base_delay_ms = 5;
        config.flow.status_retry.max_delay_ms = 10;
        config.backoff.jitter_factor = 0.0;
        config.backoff.initial_delay_ms = 5;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_redirect_scenario_completes() {
        let scenario = ScenarioReader::new(
            r#"{
                "flow_id": "flow-redirect",
                "providers": [{"id": "stripe", "supported_methods": ["card"], "responses": {
                    "start_payment": [{"intent": {"id": "pi_1", "provider": "stripe", "status": "requires_action",
                        "next_action": {"kind": "redirect", "url": "https://bank.example/3ds"}}}],
                    "get_status": [{"intent": {"id": "pi_1", "provider": "stripe", "status": "succeeded"}}]
                }}],
                "steps": [
                    {"command": {"type": "START", "provider_id": "stripe",
                        "request": {"amount": "20.00", "currency": "EUR", "method": "card"}}},
                    {"wait_for": {"state": "requires_action"}},
                    {"event": {"type": "REDIRECT_RETURNED", "provider_id": "stripe", "reference_id": "pi_1"}},
                    {"wait_for": {"state": "done"}}
                ]
            }"#
            .as_bytes(),
        )
        .read()
        .unwrap();

        let report = run_scenario(scenario, &fast_config()).await.unwrap();
        assert_eq!(report.flow_id, "flow-redirect");
        assert_eq!(report.snapshot.state, FlowState::Done);
        assert_eq!(report.calls.len(), 2);
        assert!(matches!(report.notices.last(), Some(FlowNotice::Completed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_is_reported() {
        let scenario = ScenarioReader::new(
            r#"{
                "providers": [{"id": "stripe", "supported_methods": ["card"]}],
                "steps": [{"wait_for": {"state": "done", "timeout_ms": 100}}]
            }"#
            .as_bytes(),
        )
        .read()
        .unwrap();

        let err = run_scenario(scenario, &fast_config()).await.unwrap_err();
        assert!(matches!(err, PaymentError::ScenarioError(msg) if msg.contains("timed out")));
    }
}
