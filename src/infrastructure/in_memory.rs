use crate::domain::context::ReferenceKind;
use crate::domain::failure::{ErrorCode, FlowError, PARAM_HTTP_STATUS};
use crate::domain::ports::{
    ClientConfirmRequest, ConfirmParams, FinalizeRequest, PaymentGateway, ProviderDescriptor,
    ProviderRegistry, ProviderResult,
};
use crate::domain::request::{PaymentRequest, ProviderId};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

pub const OP_START: &str = "start_payment";
pub const OP_CONFIRM: &str = "confirm_payment";
pub const OP_CANCEL: &str = "cancel_payment";
pub const OP_STATUS: &str = "get_status";
pub const OP_CLIENT_CONFIRM: &str = "client_confirm";
pub const OP_FINALIZE: &str = "finalize";

type ScriptKey = (ProviderId, &'static str);

#[derive(Default)]
struct Script {
    queues: HashMap<ScriptKey, VecDeque<ProviderResult>>,
    /// Last outcome served per key, repeated once the queue runs dry.
    last: HashMap<ScriptKey, ProviderResult>,
    calls: Vec<(ProviderId, &'static str)>,
    reference_kinds: HashMap<ProviderId, ReferenceKind>,
    latency: Duration,
}

/// A gateway that replays scripted outcomes per provider and operation.
///
/// Once a queue is exhausted its last outcome is served again, so a provider
/// scripted as "processing" stays processing. Operations that were never
/// scripted fail: capabilities with `unsupported_*`, everything else with a
/// 503 `provider_unavailable`.
#[derive(Default, Clone)]
pub struct ScriptedGateway {
    script: Arc<Mutex<Script>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, provider: &str, operation: &'static str, outcome: ProviderResult) {
        self.script()
            .queues
            .entry((provider.to_string(), operation))
            .or_default()
            .push_back(outcome);
    }

    pub fn push_start(&self, provider: &str, outcome: ProviderResult) {
        self.push(provider, OP_START, outcome);
    }

    pub fn push_confirm(&self, provider: &str, outcome: ProviderResult) {
        self.push(provider, OP_CONFIRM, outcome);
    }

    pub fn push_cancel(&self, provider: &str, outcome: ProviderResult) {
        self.push(provider, OP_CANCEL, outcome);
    }

    pub fn push_status(&self, provider: &str, outcome: ProviderResult) {
        self.push(provider, OP_STATUS, outcome);
    }

    pub fn push_client_confirm(&self, provider: &str, outcome: ProviderResult) {
        self.push(provider, OP_CLIENT_CONFIRM, outcome);
    }

    pub fn push_finalize(&self, provider: &str, outcome: ProviderResult) {
        self.push(provider, OP_FINALIZE, outcome);
    }

    pub fn set_reference_kind(&self, provider: &str, kind: ReferenceKind) {
        self.script().reference_kinds.insert(provider.to_string(), kind);
    }

    /// Simulated round-trip time applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.script().latency = latency;
    }

    pub fn calls(&self, provider: &str, operation: &str) -> usize {
        self.script()
            .calls
            .iter()
            .filter(|(p, op)| p == provider && *op == operation)
            .count()
    }

    pub fn call_log(&self) -> Vec<(ProviderId, &'static str)> {
        self.script().calls.clone()
    }

    async fn serve(&self, provider: &str, operation: &'static str) -> ProviderResult {
        let (outcome, latency) = {
            let mut script = self.script();
            let key = (provider.to_string(), operation);
            script.calls.push(key.clone());
            let outcome = match script.queues.get_mut(&key).and_then(VecDeque::pop_front) {
                Some(outcome) => {
                    script.last.insert(key, outcome.clone());
                    outcome
                }
                None => script
                    .last
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| Err(unscripted(operation))),
            };
            (outcome, script.latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        outcome
    }
}

fn unscripted(operation: &str) -> FlowError {
    match operation {
        OP_CLIENT_CONFIRM => FlowError::new(ErrorCode::UnsupportedClientConfirm),
        OP_FINALIZE => FlowError::new(ErrorCode::UnsupportedFinalize),
        _ => FlowError::new(ErrorCode::ProviderUnavailable).with_param(PARAM_HTTP_STATUS, 503),
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn start_payment(&self, provider: &str, _request: &PaymentRequest) -> ProviderResult {
        self.serve(provider, OP_START).await
    }

    async fn confirm_payment(&self, provider: &str, _params: &ConfirmParams) -> ProviderResult {
        self.serve(provider, OP_CONFIRM).await
    }

    async fn cancel_payment(&self, provider: &str, _intent_id: &str) -> ProviderResult {
        self.serve(provider, OP_CANCEL).await
    }

    async fn get_status(&self, provider: &str, _intent_id: &str) -> ProviderResult {
        self.serve(provider, OP_STATUS).await
    }

    async fn client_confirm(&self, request: &ClientConfirmRequest) -> ProviderResult {
        self.serve(&request.provider_id, OP_CLIENT_CONFIRM).await
    }

    async fn finalize(&self, request: &FinalizeRequest) -> ProviderResult {
        self.serve(&request.provider_id, OP_FINALIZE).await
    }

    fn reference_kind(&self, provider: &str) -> ReferenceKind {
        self.script()
            .reference_kinds
            .get(provider)
            .copied()
            .unwrap_or(ReferenceKind::IntentId)
    }
}

/// Provider catalog held in memory, in registration order.
#[derive(Default, Clone)]
pub struct InMemoryRegistry {
    providers: Arc<RwLock<Vec<ProviderDescriptor>>>,
}

impl InMemoryRegistry {
    pub fn new(providers: Vec<ProviderDescriptor>) -> Self {
        Self {
            providers: Arc::new(RwLock::new(providers)),
        }
    }

    /// Adds a provider or replaces the one with the same id.
    pub fn register(&self, descriptor: ProviderDescriptor) {
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        match providers.iter_mut().find(|p| p.id == descriptor.id) {
            Some(existing) => *existing = descriptor,
            None => providers.push(descriptor),
        }
    }

    pub fn set_enabled(&self, provider: &str, enabled: bool) -> bool {
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        match providers.iter_mut().find(|p| p.id == provider) {
            Some(descriptor) => {
                descriptor.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, provider: &str) -> Option<ProviderDescriptor> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| p.id == provider)
            .cloned()
    }
}

impl ProviderRegistry for InMemoryRegistry {
    fn available_providers(&self) -> Vec<ProviderDescriptor> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::FlowContext;
    use crate::domain::intent::{IntentStatus, PaymentIntent};
    use crate::domain::request::PaymentMethod;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn request() -> PaymentRequest {
        PaymentRequest::new(dec!(5.00), "USD", PaymentMethod::Card)
    }

    #[tokio::test]
    async fn test_scripted_outcomes_in_order_then_sticky() {
        let gateway = ScriptedGateway::new();
        gateway.push_status("stripe", Ok(PaymentIntent::new("pi_1", "stripe", IntentStatus::Processing)));
        gateway.push_status("stripe", Ok(PaymentIntent::new("pi_1", "stripe", IntentStatus::Succeeded)));

        let first = gateway.get_status("stripe", "pi_1").await.unwrap();
        let second = gateway.get_status("stripe", "pi_1").await.unwrap();
        let third = gateway.get_status("stripe", "pi_1").await.unwrap();
        assert_eq!(first.status, IntentStatus::Processing);
        assert_eq!(second.status, IntentStatus::Succeeded);
        assert_eq!(third.status, IntentStatus::Succeeded);
        assert_eq!(gateway.calls("stripe", OP_STATUS), 3);
    }

    #[tokio::test]
    async fn test_unscripted_operations() {
        let gateway = ScriptedGateway::new();
        let err = gateway.start_payment("adyen", &request()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ProviderUnavailable);
        assert_eq!(err.http_status(), Some(503));

        let context = FlowContext::new("flow-1", "adyen", "ref", Utc::now(), Duration::from_secs(60));
        let err = gateway
            .finalize(&FinalizeRequest {
                provider_id: "adyen".into(),
                context,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedFinalize);
        assert_eq!(
            gateway.call_log(),
            vec![("adyen".to_string(), OP_START), ("adyen".to_string(), OP_FINALIZE)]
        );
    }

    #[test]
    fn test_reference_kind_defaults_to_intent_id() {
        let gateway = ScriptedGateway::new();
        gateway.set_reference_kind("mercadopago", ReferenceKind::PreferenceId);
        assert_eq!(gateway.reference_kind("mercadopago"), ReferenceKind::PreferenceId);
        assert_eq!(gateway.reference_kind("stripe"), ReferenceKind::IntentId);
    }

    #[test]
    fn test_registry_register_and_disable() {
        let registry = InMemoryRegistry::new(vec![ProviderDescriptor::new(
            "stripe",
            vec![PaymentMethod::Card],
        )]);
        registry.register(ProviderDescriptor::new("adyen", vec![PaymentMethod::Card]));
        registry.register(ProviderDescriptor::new("stripe", vec![PaymentMethod::Wallet]));
        assert_eq!(registry.available_providers().len(), 2);
        assert!(registry.get("stripe").unwrap().supports(PaymentMethod::Wallet));

        assert!(registry.set_enabled("adyen", false));
        assert!(!registry.set_enabled("paypal", false));
        assert!(!registry.get("adyen").unwrap().enabled);
    }
}
