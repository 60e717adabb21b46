#![allow(dead_code)]

use payflow::application::fallback::state::FallbackConfig;
use payflow::application::flow::config::FlowConfig;
use payflow::application::flow::runtime::{FlowDeps, FlowHandle};
use payflow::domain::failure::{ErrorCode, FlowError, PARAM_HTTP_STATUS};
use payflow::domain::intent::{IntentStatus, NextAction, PaymentIntent};
use payflow::domain::ports::ProviderDescriptor;
use payflow::domain::request::{PaymentMethod, PaymentRequest};
use payflow::infrastructure::in_memory::{InMemoryRegistry, ScriptedGateway};
use rust_decimal_macros::dec;
use std::sync::Arc;

pub fn request() -> PaymentRequest {
    PaymentRequest::new(dec!(25.00), "EUR", PaymentMethod::Card)
}

pub fn intent(provider: &str, id: &str, status: IntentStatus) -> PaymentIntent {
    PaymentIntent::new(id, provider, status)
}

pub fn redirect(provider: &str, id: &str) -> PaymentIntent {
    intent(provider, id, IntentStatus::RequiresAction).with_next_action(NextAction::Redirect {
        url: format!("https://{provider}.example/3ds/{id}"),
    })
}

pub fn client_confirm(provider: &str, id: &str) -> PaymentIntent {
    intent(provider, id, IntentStatus::RequiresAction).with_next_action(NextAction::ClientConfirm {
        payload: serde_json::json!({"client_secret": format!("{id}_secret")}),
    })
}

pub fn unavailable() -> FlowError {
    FlowError::new(ErrorCode::ProviderUnavailable).with_param(PARAM_HTTP_STATUS, 503)
}

pub fn card_providers(ids: &[&str]) -> Arc<InMemoryRegistry> {
    Arc::new(InMemoryRegistry::new(
        ids.iter()
            .map(|id| ProviderDescriptor::new(*id, vec![PaymentMethod::Card]))
            .collect(),
    ))
}

/// Short, jitter-free delays so paused-clock tests stay readable.
pub fn fast_flow_config() -> FlowConfig {
    let mut config = FlowConfig {
        jitter_factor: 0.0,
        ..FlowConfig::default()
    };
    config.polling.base_delay_ms = 10;
    config.polling.max_delay_ms = 40;
    config.status_retry.base_delay_ms = 5;
    config.status_retry.max_delay_ms = 20;
    config
}

pub fn deps(gateway: Arc<ScriptedGateway>, registry: Arc<InMemoryRegistry>) -> FlowDeps {
    FlowDeps {
        gateway,
        registry,
        config: fast_flow_config(),
        fallback: FallbackConfig::default(),
    }
}

pub fn spawn_flow(gateway: Arc<ScriptedGateway>, providers: &[&str]) -> FlowHandle {
    FlowHandle::spawn(deps(gateway, card_providers(providers)))
}
