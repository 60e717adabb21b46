use crate::domain::context::ReferenceSet;
use crate::domain::request::ProviderId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl IntentStatus {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            IntentStatus::Succeeded | IntentStatus::Failed | IntentStatus::Canceled
        )
    }

    pub fn requires_user(&self) -> bool {
        matches!(
            self,
            IntentStatus::RequiresPaymentMethod
                | IntentStatus::RequiresConfirmation
                | IntentStatus::RequiresAction
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NextAction {
    Redirect {
        url: String,
    },
    ClientConfirm {
        #[serde(default)]
        payload: serde_json::Value,
    },
    ExternalWait {
        #[serde(default)]
        instructions: Option<String>,
    },
}

/// Where an adopted intent sends the flow next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentRoute {
    Final,
    RequiresAction,
    Poll,
}

/// Server-side snapshot of a payment attempt. Replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub provider: ProviderId,
    pub status: IntentStatus,
    #[serde(default)]
    pub next_action: Option<NextAction>,
    #[serde(default)]
    pub finalize_required: bool,
    /// Extra provider identifiers (order, payment, preference ids).
    #[serde(default)]
    pub references: ReferenceSet,
}

impl PaymentIntent {
    pub fn new(id: impl Into<String>, provider: impl Into<ProviderId>, status: IntentStatus) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            status,
            next_action: None,
            finalize_required: false,
            references: ReferenceSet::default(),
        }
    }

    pub fn with_next_action(mut self, action: NextAction) -> Self {
        self.next_action = Some(action);
        self
    }

    pub fn with_finalize_required(mut self) -> Self {
        self.finalize_required = true;
        self
    }

    pub fn with_references(mut self, references: ReferenceSet) -> Self {
        self.references = references;
        self
    }

    pub fn needs_client_confirm(&self) -> bool {
        matches!(self.next_action, Some(NextAction::ClientConfirm { .. }))
    }

    pub fn route(&self) -> IntentRoute {
        if self.status.is_final() {
            return IntentRoute::Final;
        }
        let waits_externally = matches!(self.next_action, Some(NextAction::ExternalWait { .. }));
        if self.status.requires_user() && !waits_externally {
            IntentRoute::RequiresAction
        } else {
            IntentRoute::Poll
        }
    }
}
