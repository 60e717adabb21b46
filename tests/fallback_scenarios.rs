mod common;

use common::{card_providers, deps, intent, request, unavailable};
use payflow::application::fallback::state::{
    FallbackConfig, FallbackEvent, FallbackMode, FallbackResponse, FallbackState, FallbackStatus,
};
use payflow::application::fallback::{FallbackOrchestrator, attach};
use payflow::application::flow::events::Command;
use payflow::application::flow::runtime::FlowHandle;
use payflow::application::flow::state::FlowState;
use payflow::domain::failure::ErrorCode;
use payflow::domain::intent::IntentStatus;
use payflow::infrastructure::in_memory::{OP_START, ScriptedGateway};
use std::sync::Arc;
use std::time::Duration;

fn start(provider: &str) -> Command {
    Command::Start {
        provider_id: provider.into(),
        request: request(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_chain_exhausts_and_resets_to_idle() {
    let orchestrator = FallbackOrchestrator::new(
        FallbackConfig {
            max_attempts: 2,
            ..FallbackConfig::default()
        },
        card_providers(&["stripe", "paypal"]),
    );
    let mut events = orchestrator.subscribe();

    assert!(orchestrator.report_failure("flow-1", "stripe", &unavailable(), &request(), false));
    let FallbackEvent::Available { event, .. } = events.recv().await.unwrap() else {
        panic!("expected a fallback offer");
    };
    assert_eq!(event.alternative_providers, vec!["paypal"]);
    assert_eq!(orchestrator.state("flow-1").status, FallbackStatus::Pending);

    assert!(orchestrator.report_failure("flow-1", "paypal", &unavailable(), &request(), false));
    assert!(matches!(
        events.recv().await.unwrap(),
        FallbackEvent::Exhausted { attempts: 2, .. }
    ));
    assert_eq!(orchestrator.state("flow-1").status, FallbackStatus::Failed);

    tokio::time::sleep(Duration::from_millis(1)).await;
    let state = orchestrator.state("flow-1");
    assert_eq!(state, FallbackState::default());
    assert!(state.failed_attempts.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_declined_offer_finishes_flow() {
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.push_start("stripe", Err(unavailable()));
    let registry = card_providers(&["stripe", "paypal"]);
    let orchestrator = FallbackOrchestrator::new(FallbackConfig::default(), registry.clone());

    let flow = FlowHandle::spawn(deps(gateway.clone(), registry));
    let _bridge = attach(flow.clone(), orchestrator.clone());
    flow.send(start("stripe")).unwrap();

    flow.wait_for_state(FlowState::FallbackCandidate).await.unwrap();
    let offer = orchestrator.state(flow.flow_id()).pending_event.unwrap();
    orchestrator.respond_to_fallback(
        flow.flow_id(),
        &FallbackResponse {
            event_id: offer.event_id,
            accepted: false,
            selected_provider: None,
        },
    );

    flow.wait_for_state(FlowState::Done).await.unwrap();
    assert_eq!(orchestrator.state(flow.flow_id()).status, FallbackStatus::Cancelled);
    assert_eq!(gateway.calls("paypal", OP_START), 0);
}

#[tokio::test(start_paused = true)]
async fn test_accepted_offer_switches_provider() {
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.push_start("stripe", Err(unavailable()));
    gateway.push_start("paypal", Ok(intent("paypal", "pp_1", IntentStatus::Succeeded)));
    let registry = card_providers(&["stripe", "paypal", "adyen"]);
    let orchestrator = FallbackOrchestrator::new(FallbackConfig::default(), registry.clone());

    let flow = FlowHandle::spawn(deps(gateway.clone(), registry));
    let _bridge = attach(flow.clone(), orchestrator.clone());
    flow.send(start("stripe")).unwrap();

    let candidate = flow.wait_for_state(FlowState::FallbackCandidate).await.unwrap();
    assert_eq!(candidate.context.fallback.alternatives, vec!["paypal", "adyen"]);
    assert!(candidate.context.fallback.eligible);

    let offer = orchestrator.state(flow.flow_id()).pending_event.unwrap();
    assert!(orchestrator.respond_to_fallback(
        flow.flow_id(),
        &FallbackResponse {
            event_id: offer.event_id,
            accepted: true,
            selected_provider: Some("paypal".into()),
        },
    ));

    let done = flow.wait_for_state(FlowState::Done).await.unwrap();
    assert_eq!(done.context.provider_id.as_deref(), Some("paypal"));
    assert_eq!(done.context.intent_id.as_deref(), Some("pp_1"));
    assert_eq!(done.context.fallback.attempted_providers, vec!["stripe", "paypal"]);
    // The original request is carried over unchanged.
    assert_eq!(done.context.request, Some(request()));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let state = orchestrator.state(flow.flow_id());
    assert_eq!(state.status, FallbackStatus::Completed);
    assert_eq!(state.current_provider.as_deref(), Some("paypal"));
}

#[tokio::test(start_paused = true)]
async fn test_auto_fallback_chain_exhausts_leaving_flow_failed() {
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.push_start("stripe", Err(unavailable()));
    gateway.push_start("paypal", Err(unavailable()));
    let registry = card_providers(&["stripe", "paypal"]);
    let orchestrator = FallbackOrchestrator::new(
        FallbackConfig {
            mode: FallbackMode::Auto,
            auto_fallback_delay_ms: 500,
            ..FallbackConfig::default()
        },
        registry.clone(),
    );
    let mut events = orchestrator.subscribe();

    let flow = FlowHandle::spawn(deps(gateway.clone(), registry));
    let _bridge = attach(flow.clone(), orchestrator.clone());
    flow.send(start("stripe")).unwrap();

    assert!(matches!(events.recv().await.unwrap(), FallbackEvent::AutoStarted { .. }));
    assert!(matches!(
        events.recv().await.unwrap(),
        FallbackEvent::Execute { is_auto: true, ref provider, .. } if provider == "paypal"
    ));
    assert!(matches!(events.recv().await.unwrap(), FallbackEvent::Exhausted { attempts: 2, .. }));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let snapshot = flow.snapshot();
    assert_eq!(snapshot.state, FlowState::Failed);
    assert_eq!(snapshot.context.provider_id.as_deref(), Some("paypal"));
    assert_eq!(
        snapshot.context.error.map(|e| e.code),
        Some(ErrorCode::ProviderUnavailable)
    );
    assert_eq!(gateway.calls("stripe", OP_START), 1);
    assert_eq!(gateway.calls("paypal", OP_START), 1);
    assert_eq!(orchestrator.state(flow.flow_id()), FallbackState::default());
}

#[tokio::test(start_paused = true)]
async fn test_non_trigger_error_offers_no_fallback() {
    let gateway = Arc::new(ScriptedGateway::new());
    let registry = card_providers(&["stripe", "paypal"]);
    let orchestrator = FallbackOrchestrator::new(FallbackConfig::default(), registry.clone());

    let flow = FlowHandle::spawn(deps(gateway.clone(), registry));
    let _bridge = attach(flow.clone(), orchestrator.clone());
    flow.send(Command::Start {
        provider_id: "stripe".into(),
        request: {
            let mut invalid = request();
            invalid.currency = "euro".into();
            invalid
        },
    })
    .unwrap();

    let failed = flow.wait_for_state(FlowState::Failed).await.unwrap();
    assert_eq!(failed.context.error.map(|e| e.code), Some(ErrorCode::InvalidRequest));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(flow.snapshot().state, FlowState::Failed);
    assert_eq!(orchestrator.state(flow.flow_id()), FallbackState::default());
    assert!(gateway.call_log().is_empty());
}
