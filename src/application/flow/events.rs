use crate::application::fallback::state::FallbackMode;
use crate::domain::failure::FlowError;
use crate::domain::intent::PaymentIntent;
use crate::domain::ports::ProviderResult;
use crate::domain::request::{PaymentRequest, ProviderId};
use serde::{Deserialize, Serialize};

/// Commands issued by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Start {
        provider_id: ProviderId,
        request: PaymentRequest,
    },
    Confirm {
        provider_id: ProviderId,
        intent_id: String,
        #[serde(default)]
        return_url: Option<String>,
    },
    Cancel {
        provider_id: ProviderId,
        intent_id: String,
    },
    Refresh {
        #[serde(default)]
        provider_id: Option<ProviderId>,
        #[serde(default)]
        intent_id: Option<String>,
    },
    Reset,
    FallbackRequested {
        failed_provider_id: ProviderId,
        request: PaymentRequest,
        #[serde(default)]
        mode: Option<FallbackMode>,
    },
    FallbackExecute {
        provider_id: ProviderId,
        request: PaymentRequest,
    },
    FallbackAbort,
}

/// Signals arriving from outside the caller's control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemEvent {
    RedirectReturned {
        provider_id: ProviderId,
        reference_id: String,
    },
    WebhookReceived {
        provider_id: ProviderId,
        reference_id: String,
        event_id: String,
        #[serde(default)]
        raw: Option<serde_json::Value>,
    },
    ExternalStatusUpdated {
        provider_id: ProviderId,
        reference_id: String,
        #[serde(default)]
        event_id: Option<String>,
    },
}

impl SystemEvent {
    pub fn provider_id(&self) -> &str {
        match self {
            SystemEvent::RedirectReturned { provider_id, .. }
            | SystemEvent::WebhookReceived { provider_id, .. }
            | SystemEvent::ExternalStatusUpdated { provider_id, .. } => provider_id,
        }
    }

    pub fn reference_id(&self) -> &str {
        match self {
            SystemEvent::RedirectReturned { reference_id, .. }
            | SystemEvent::WebhookReceived { reference_id, .. }
            | SystemEvent::ExternalStatusUpdated { reference_id, .. } => reference_id,
        }
    }

    pub fn event_id(&self) -> Option<&str> {
        match self {
            SystemEvent::RedirectReturned { .. } => None,
            SystemEvent::WebhookReceived { event_id, .. } => Some(event_id),
            SystemEvent::ExternalStatusUpdated { event_id, .. } => event_id.as_deref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SystemEvent::RedirectReturned { .. } => "redirect_returned",
            SystemEvent::WebhookReceived { .. } => "webhook_received",
            SystemEvent::ExternalStatusUpdated { .. } => "external_status_updated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Start,
    Confirm,
    Cancel,
    GetStatus,
    ClientConfirm,
    Finalize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Poll,
    StatusRetry,
}

/// Everything the machine consumes from its queue.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    Command(Command),
    System(SystemEvent),
    /// A provider call finished. `token` identifies the invocation.
    Settled {
        token: u64,
        operation: Operation,
        result: ProviderResult,
    },
    TimerFired {
        token: u64,
        kind: TimerKind,
    },
    Shutdown,
}

/// Outward notifications, e.g. for the fallback orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowNotice {
    Failed {
        flow_id: String,
        provider: ProviderId,
        error: FlowError,
        request: Option<PaymentRequest>,
    },
    Completed {
        flow_id: String,
        provider: ProviderId,
        intent: PaymentIntent,
    },
}
