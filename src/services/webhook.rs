use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::{
    api::gateway::ORDER_ID_METADATA_KEY,
    app_error::AppError,
    domain::AttemptStatus,
    services::confirmation::{ConfirmationHandler, ConfirmationResult, GatewayOutcome, OutcomeSource},
};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is missing")]
    Missing,
    #[error("signature header is malformed")]
    Malformed,
    #[error("signature timestamp is outside the tolerance window")]
    Expired,
    #[error("no signature matches the payload")]
    Mismatch,
}

fn signed_mac(payload: &[u8], secret: &str, timestamp: i64) -> Result<HmacSha256, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Mismatch)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"`.
pub fn compute_signature(
    payload: &[u8],
    secret: &str,
    timestamp: i64,
) -> Result<String, SignatureError> {
    let mac = signed_mac(payload, secret, timestamp)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a `t=<unix>,v1=<hex>[,v1=<hex>...]` header against the raw payload.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance: Duration,
    now: i64,
) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = Some(value.parse::<i64>().map_err(|_| SignatureError::Malformed)?),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if now.abs_diff(timestamp) > tolerance.as_secs() {
        return Err(SignatureError::Expired);
    }

    let mac = signed_mac(payload, secret, timestamp)?;
    let matched = signatures.iter().any(|signature| {
        hex::decode(signature)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntentObject {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub last_payment_error: Option<LastPaymentError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LastPaymentError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl IntentObject {
    fn order_hint(&self) -> Option<i32> {
        self.metadata
            .get(ORDER_ID_METADATA_KEY)
            .and_then(|id| id.trim().parse().ok())
    }

    fn failure_reason(&self) -> Option<String> {
        let error = self.last_payment_error.as_ref()?;
        match (&error.code, &error.message) {
            (Some(code), Some(message)) => Some(format!("{}: {}", code, message)),
            (None, Some(message)) => Some(message.clone()),
            (Some(code), None) => Some(code.clone()),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventKind {
    Succeeded,
    Failed,
    Canceled,
    Other,
}

impl WebhookEventKind {
    pub fn from_event_type(event_type: &str) -> Self {
        match event_type {
            "payment_intent.succeeded" => WebhookEventKind::Succeeded,
            "payment_intent.payment_failed" => WebhookEventKind::Failed,
            "payment_intent.canceled" => WebhookEventKind::Canceled,
            _ => WebhookEventKind::Other,
        }
    }

    fn attempt_status(self) -> Option<AttemptStatus> {
        match self {
            WebhookEventKind::Succeeded => Some(AttemptStatus::Succeeded),
            WebhookEventKind::Failed => Some(AttemptStatus::Failed),
            WebhookEventKind::Canceled => Some(AttemptStatus::Canceled),
            WebhookEventKind::Other => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Processed,
    Duplicate,
    DuplicateCharge,
    Ignored,
    Unresolved,
    Error,
}

/// Body returned to the processor for every authenticated delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct WebhookAck {
    pub status: AckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<i32>,
}

impl WebhookAck {
    fn new(status: AckStatus, order_id: Option<i32>) -> Self {
        Self { status, order_id }
    }
}

impl From<&ConfirmationResult> for WebhookAck {
    fn from(result: &ConfirmationResult) -> Self {
        let status = match result {
            ConfirmationResult::Paid { .. } | ConfirmationResult::AttemptClosed { .. } => {
                AckStatus::Processed
            }
            ConfirmationResult::Duplicate { .. } => AckStatus::Duplicate,
            ConfirmationResult::DuplicateCharge { .. } => AckStatus::DuplicateCharge,
            ConfirmationResult::Unresolved { .. } => AckStatus::Unresolved,
            ConfirmationResult::Ineligible { .. }
            | ConfirmationResult::Pending { .. }
            | ConfirmationResult::Ignored { .. } => AckStatus::Ignored,
        };
        WebhookAck::new(status, result.order_id())
    }
}

pub struct WebhookReceiver {
    secret: String,
    tolerance: Duration,
    confirmations: Arc<ConfirmationHandler>,
}

impl WebhookReceiver {
    pub fn new(secret: String, tolerance: Duration, confirmations: Arc<ConfirmationHandler>) -> Self {
        Self {
            secret,
            tolerance,
            confirmations,
        }
    }

    /// Authenticates, parses and applies one delivery. Only an unauthenticated
    /// or unparsable request and an unavailable store are surfaced as errors;
    /// everything else is acknowledged so the processor stops redelivering.
    pub async fn receive(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookAck, AppError> {
        let header = signature.ok_or_else(|| AppError::WebhookAuth(SignatureError::Missing.to_string()))?;
        verify_signature(payload, header, &self.secret, self.tolerance, Utc::now().timestamp())
            .map_err(|err| AppError::WebhookAuth(err.to_string()))?;

        let event: WebhookEvent = serde_json::from_slice(payload).map_err(|err| {
            error!("Malformed webhook payload: {}", err);
            AppError::Validation("Malformed webhook payload".into())
        })?;
        info!("Received event: {} ({})", event.id, event.event_type);

        let kind = WebhookEventKind::from_event_type(&event.event_type);
        let Some(status) = kind.attempt_status() else {
            return Ok(WebhookAck::new(AckStatus::Ignored, None));
        };

        let intent: IntentObject = serde_json::from_value(event.data.object).map_err(|err| {
            error!(event_id = %event.id, "Malformed payment intent in webhook: {}", err);
            AppError::Validation("Malformed webhook payload".into())
        })?;

        let order_hint = intent.order_hint();
        let outcome = GatewayOutcome {
            intent_id: intent.id.clone(),
            status,
            order_hint,
            failure_reason: intent.failure_reason(),
            source: OutcomeSource::Webhook {
                event_id: event.id.clone(),
            },
        };

        match self.confirmations.apply(outcome).await {
            Ok(result) => Ok(WebhookAck::from(&result)),
            Err(err @ AppError::ServiceUnavailable(_)) => Err(err),
            Err(err) => {
                error!(
                    event_id = %event.id,
                    intent_id = %intent.id,
                    order_id = ?order_hint,
                    manual_follow_up = true,
                    "Failed to apply webhook event: {:#}",
                    err
                );
                warn!("Acknowledging event {} to stop redelivery", event.id);
                Ok(WebhookAck::new(AckStatus::Error, order_hint))
            }
        }
    }
}
