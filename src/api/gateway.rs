use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{AttemptStatus, Money};

/// Metadata key carrying the owning order id on every intent we create.
pub const ORDER_ID_METADATA_KEY: &str = "order_id";

/// Failure classes of a gateway call. Each one is handled differently by the
/// caller, so they must never be folded into a single generic error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Payment gateway is not configured: {0}")]
    Configuration(String),

    #[error("Payment rejected by the processor ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("Payment gateway is temporarily unavailable: {0}")]
    Transient(String),

    #[error("Payment gateway timed out, the outcome is unknown")]
    Timeout,

    #[error("Unexpected response from the payment gateway: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transient(_) | GatewayError::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    #[serde(other)]
    Unknown,
}

impl IntentStatus {
    /// Terminal attempt status the processor reports, if any.
    pub fn terminal_outcome(self) -> Option<AttemptStatus> {
        match self {
            IntentStatus::Succeeded => Some(AttemptStatus::Succeeded),
            IntentStatus::Canceled => Some(AttemptStatus::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: IntentStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl PaymentIntent {
    pub fn order_id(&self) -> Option<i32> {
        self.metadata
            .get(ORDER_ID_METADATA_KEY)
            .and_then(|id| id.trim().parse().ok())
    }
}

/// `pi_` followed by ASCII alphanumerics or underscores.
pub fn is_intent_id(id: &str) -> bool {
    id.strip_prefix("pi_").is_some_and(|rest| {
        !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

#[derive(Debug, Clone)]
pub struct CreateIntent {
    pub order_id: i32,
    pub amount: Money,
    /// Reused verbatim when retrying after an unknown outcome.
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

/// Outbound port to an external payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn create_intent(&self, request: CreateIntent) -> Result<PaymentIntent, GatewayError>;

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_ids_are_a_single_path_segment() {
        assert!(is_intent_id("pi_3Nx9aLkd"));
        assert!(is_intent_id("pi_fake_1"));
        assert!(!is_intent_id("pi_"));
        assert!(!is_intent_id("cus_123"));
        assert!(!is_intent_id("pi_x/../../v1/customers"));
        assert!(!is_intent_id("pi_1?expand[]=customer"));
    }
}
