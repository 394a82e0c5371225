use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::{
    api::gateway::{CreateIntent, GatewayError, ORDER_ID_METADATA_KEY, PaymentGateway, PaymentIntent},
    config::GatewayConfig,
};

/// Stripe PaymentIntents adapter. One outbound call per operation, no retries here.
pub struct StripeGateway {
    client: Client,
    api_base: String,
    secret_key: String,
    name: String,
}

impl StripeGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: config.api_base.clone(),
            secret_key: config.secret_key.clone(),
            name: config.name.clone(),
        })
    }

    /// Builds `/v1/payment_intents/{id}` with the id escaped as one segment.
    fn intent_url(&self, intent_id: &str) -> Result<Url, GatewayError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| GatewayError::Configuration(format!("Invalid API base: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| GatewayError::Configuration("API base cannot take a path".into()))?
            .pop_if_empty()
            .extend(["v1", "payment_intents", intent_id]);
        Ok(url)
    }

    async fn read_intent(response: Response) -> Result<PaymentIntent, GatewayError> {
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
        } else {
            Err(classify_error(status, &body))
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, request), fields(order_id = request.order_id, amount_minor = request.amount.minor()))]
    async fn create_intent(&self, request: CreateIntent) -> Result<PaymentIntent, GatewayError> {
        let mut form: Vec<(String, String)> = vec![
            ("amount".into(), request.amount.minor().to_string()),
            ("currency".into(), request.amount.currency().code().to_string()),
            ("automatic_payment_methods[enabled]".into(), "true".into()),
            (
                format!("metadata[{}]", ORDER_ID_METADATA_KEY),
                request.order_id.to_string(),
            ),
        ];
        form.extend(
            request
                .metadata
                .iter()
                .filter(|(key, _)| key.as_str() != ORDER_ID_METADATA_KEY)
                .map(|(key, value)| (format!("metadata[{}]", key), value.clone())),
        );

        let response = self
            .client
            .post(format!("{}/v1/payment_intents", self.api_base))
            .bearer_auth(&self.secret_key)
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        let intent = Self::read_intent(response).await?;
        info!("Created payment intent {} for order #{}", intent.id, request.order_id);
        Ok(intent)
    }

    #[instrument(skip(self))]
    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        let url = self.intent_url(intent_id)?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(transport_error)?;

        Self::read_intent(response).await
    }
}

fn transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        warn!("Payment gateway call timed out: {}", err);
        GatewayError::Timeout
    } else {
        GatewayError::Transient(err.to_string())
    }
}

#[derive(Deserialize, Default)]
struct StripeErrorBody {
    #[serde(default)]
    error: StripeErrorDetail,
}

#[derive(Deserialize, Default)]
struct StripeErrorDetail {
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<String>,
    decline_code: Option<String>,
    message: Option<String>,
}

/// Maps a non-success processor response onto the gateway error taxonomy.
pub fn classify_error(status: StatusCode, body: &str) -> GatewayError {
    let detail = serde_json::from_str::<StripeErrorBody>(body)
        .unwrap_or_default()
        .error;
    let message = detail
        .message
        .clone()
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    match status.as_u16() {
        401 | 403 => GatewayError::Configuration(message),
        429 => GatewayError::Transient(message),
        500..=599 => GatewayError::Transient(message),
        400 | 402 | 404 | 409 => {
            if detail.kind.as_deref() == Some("authentication_error") {
                return GatewayError::Configuration(message);
            }
            let code = detail
                .decline_code
                .or(detail.code)
                .or(detail.kind)
                .unwrap_or_else(|| "unknown".to_string());
            GatewayError::Rejected { code, message }
        }
        _ => GatewayError::InvalidResponse(message),
    }
}
