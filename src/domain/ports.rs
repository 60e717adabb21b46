use super::context::{FlowContext, ReferenceKind};
use super::failure::FlowError;
use super::intent::{NextAction, PaymentIntent};
use super::request::{PaymentMethod, PaymentRequest, ProviderId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type ProviderResult = std::result::Result<PaymentIntent, FlowError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmParams {
    pub intent_id: String,
    #[serde(default)]
    pub return_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfirmRequest {
    pub provider_id: ProviderId,
    pub action: NextAction,
    pub context: FlowContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub provider_id: ProviderId,
    pub context: FlowContext,
}

/// Provider operations consumed by the flow engine.
///
/// Implementations own request mapping, transport and idempotency keys.
/// Every failure is reported as a normalized [`FlowError`].
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn start_payment(&self, provider: &str, request: &PaymentRequest) -> ProviderResult;
    async fn confirm_payment(&self, provider: &str, params: &ConfirmParams) -> ProviderResult;
    async fn cancel_payment(&self, provider: &str, intent_id: &str) -> ProviderResult;
    async fn get_status(&self, provider: &str, intent_id: &str) -> ProviderResult;
    /// Fails with `unsupported_client_confirm` when the provider lacks the capability.
    async fn client_confirm(&self, request: &ClientConfirmRequest) -> ProviderResult;
    /// Fails with `unsupported_finalize` when the provider has nothing to settle.
    async fn finalize(&self, request: &FinalizeRequest) -> ProviderResult;

    /// Slot filled by the `referenceId` of external events for this provider.
    fn reference_kind(&self, _provider: &str) -> ReferenceKind {
        ReferenceKind::IntentId
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub supported_methods: Vec<PaymentMethod>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Base endpoint used to key circuit breakers.
    #[serde(default)]
    pub base_url: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl ProviderDescriptor {
    pub fn new(id: impl Into<ProviderId>, supported_methods: Vec<PaymentMethod>) -> Self {
        Self {
            id: id.into(),
            supported_methods,
            enabled: true,
            base_url: None,
        }
    }

    pub fn supports(&self, method: PaymentMethod) -> bool {
        self.supported_methods.contains(&method)
    }

    pub fn endpoint(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| format!("provider://{}", self.id))
    }
}

/// Catalog of providers a flow may fall back to.
pub trait ProviderRegistry: Send + Sync {
    fn available_providers(&self) -> Vec<ProviderDescriptor>;
}

pub type SharedGateway = Arc<dyn PaymentGateway>;
pub type SharedRegistry = Arc<dyn ProviderRegistry>;
