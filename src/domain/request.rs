use crate::domain::failure::FlowError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type ProviderId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Wallet,
    BankTransfer,
    Pix,
}

/// What the caller asked to pay for.
///
/// The request is carried unmodified through fallback: an alternative
/// provider receives exactly what the first provider received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    /// Merchant-side reference. Defaults to the flow id when absent.
    #[serde(default)]
    pub external_reference: Option<String>,
    #[serde(default)]
    pub return_url: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PaymentRequest {
    pub fn new(amount: Decimal, currency: impl Into<String>, method: PaymentMethod) -> Self {
        Self {
            amount,
            currency: currency.into(),
            method,
            external_reference: None,
            return_url: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Local validation performed before any provider is contacted.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.amount <= Decimal::ZERO {
            return Err(FlowError::invalid_request("amount_not_positive"));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(FlowError::invalid_request("currency_invalid"));
        }
        Ok(())
    }
}
