use crate::domain::failure::FlowError;
use crate::domain::intent::PaymentIntent;
use crate::domain::request::ProviderId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Which identifier slot an external reference fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    IntentId,
    OrderId,
    PaymentId,
    PreferenceId,
}

/// Per-provider correlation identifiers.
///
/// Providers expose different kinds of ids; a merge only ever fills or
/// replaces slots with concrete values, never clears them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference_id: Option<String>,
}

impl ReferenceSet {
    pub fn get(&self, kind: ReferenceKind) -> Option<&str> {
        match kind {
            ReferenceKind::IntentId => self.intent_id.as_deref(),
            ReferenceKind::OrderId => self.order_id.as_deref(),
            ReferenceKind::PaymentId => self.payment_id.as_deref(),
            ReferenceKind::PreferenceId => self.preference_id.as_deref(),
        }
    }

    fn slot_mut(&mut self, kind: ReferenceKind) -> &mut Option<String> {
        match kind {
            ReferenceKind::IntentId => &mut self.intent_id,
            ReferenceKind::OrderId => &mut self.order_id,
            ReferenceKind::PaymentId => &mut self.payment_id,
            ReferenceKind::PreferenceId => &mut self.preference_id,
        }
    }

    pub fn set(&mut self, kind: ReferenceKind, value: impl Into<String>) {
        *self.slot_mut(kind) = Some(value.into());
    }

    /// Copies every concrete value of `other` into `self`.
    pub fn merge(&mut self, other: &ReferenceSet) {
        for kind in [
            ReferenceKind::IntentId,
            ReferenceKind::OrderId,
            ReferenceKind::PaymentId,
            ReferenceKind::PreferenceId,
        ] {
            if let Some(value) = other.get(kind) {
                self.set(kind, value);
            }
        }
    }

    /// Canonical key for status checks: `payment_id > order_id > intent_id > preference_id`.
    pub fn status_key(&self) -> Option<&str> {
        self.payment_id
            .as_deref()
            .or(self.order_id.as_deref())
            .or(self.intent_id.as_deref())
            .or(self.preference_id.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.status_key().is_none()
    }
}

/// Correlation state of one payment flow.
///
/// Created on START, updated on every intent and external event, dropped on RESET.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowContext {
    pub flow_id: String,
    pub provider_id: ProviderId,
    pub external_reference: String,
    #[serde(default)]
    pub provider_refs: BTreeMap<ProviderId, ReferenceSet>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub last_return_nonce: Option<String>,
    #[serde(default)]
    pub last_external_event_id: Option<String>,
    #[serde(default)]
    pub seen_event_ids: BTreeSet<String>,
}

impl FlowContext {
    pub fn new(
        flow_id: impl Into<String>,
        provider_id: impl Into<ProviderId>,
        external_reference: impl Into<String>,
        created_at: DateTime<Utc>,
        ttl: std::time::Duration,
    ) -> Self {
        let ttl = Duration::from_std(ttl).unwrap_or(Duration::MAX);
        Self {
            flow_id: flow_id.into(),
            provider_id: provider_id.into(),
            external_reference: external_reference.into(),
            provider_refs: BTreeMap::new(),
            created_at,
            expires_at: created_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            last_return_nonce: None,
            last_external_event_id: None,
            seen_event_ids: BTreeSet::new(),
        }
    }

    pub fn references(&self, provider: &str) -> Option<&ReferenceSet> {
        self.provider_refs.get(provider)
    }

    /// Folds the identifiers of a fresh intent into the reference set of its provider.
    pub fn record_intent(&mut self, intent: &PaymentIntent) {
        let refs = self.provider_refs.entry(intent.provider.clone()).or_default();
        refs.merge(&intent.references);
        refs.set(ReferenceKind::IntentId, intent.id.as_str());
    }

    /// Fails when a different reference of the same kind is already stored.
    pub fn check_reference(
        &self,
        provider: &str,
        kind: ReferenceKind,
        reference_id: &str,
    ) -> Result<(), FlowError> {
        match self.references(provider).and_then(|refs| refs.get(kind)) {
            Some(stored) if stored != reference_id => {
                Err(FlowError::correlation_mismatch(stored, reference_id))
            }
            _ => Ok(()),
        }
    }

    /// Stores the reference. Applying the same reference twice is a no-op.
    /// Returns whether anything changed.
    pub fn apply_reference(
        &mut self,
        provider: &str,
        kind: ReferenceKind,
        reference_id: &str,
    ) -> Result<bool, FlowError> {
        self.check_reference(provider, kind, reference_id)?;
        let refs = self.provider_refs.entry(provider.to_string()).or_default();
        if refs.get(kind) == Some(reference_id) {
            return Ok(false);
        }
        refs.set(kind, reference_id);
        Ok(true)
    }

    pub fn status_key(&self, provider: &str) -> Option<&str> {
        self.references(provider).and_then(ReferenceSet::status_key)
    }

    /// Same event id seen before, or same reference as the last processed return.
    pub fn is_duplicate(&self, event_id: Option<&str>, reference_id: &str) -> bool {
        match event_id {
            Some(id) if self.seen_event_ids.contains(id) => true,
            _ => self.last_return_nonce.as_deref() == Some(reference_id),
        }
    }

    pub fn mark_processed(&mut self, event_id: Option<&str>, reference_id: &str) {
        if let Some(id) = event_id {
            self.seen_event_ids.insert(id.to_string());
            self.last_external_event_id = Some(id.to_string());
        }
        self.last_return_nonce = Some(reference_id.to_string());
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
