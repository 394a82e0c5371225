use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::{api::gateway::GatewayError, domain::StatusError, stores::StoreError};

/// Envelope shared by every JSON response of the service.
#[derive(Serialize, Debug, ToSchema)]
pub struct StdResponse<T, M> {
    pub data: Option<T>,
    pub message: Option<M>,
}

impl<T: Serialize, M: Serialize> IntoResponse for StdResponse<T, M> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Gateway(GatewayError),

    #[error("Webhook authentication failed: {0}")]
    WebhookAuth(String),

    #[error("No order could be resolved for payment intent {intent_id}")]
    ReconciliationGap { intent_id: String },

    #[error("{0} is unavailable")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::WebhookAuth(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Gateway(GatewayError::Rejected { .. }) => StatusCode::PAYMENT_REQUIRED,
            AppError::Gateway(GatewayError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Gateway(_) => StatusCode::BAD_GATEWAY,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ReconciliationGap { .. } => StatusCode::OK,
            AppError::Configuration(_) | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Gateway(err) => err.is_retryable(),
            AppError::ServiceUnavailable(_) => true,
            _ => false,
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Configuration(reason) => AppError::Configuration(reason),
            other => AppError::Gateway(other),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => {
                tracing::error!("Order store unavailable: {}", reason);
                AppError::ServiceUnavailable("Order store".into())
            }
            other => AppError::Other(other.into()),
        }
    }
}

impl From<StatusError> for AppError {
    fn from(err: StatusError) -> Self {
        AppError::Other(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = ?self, "Request failed");
        } else {
            tracing::warn!(error = %self, "Request rejected");
        }

        let message = match &self {
            AppError::Gateway(err) if err.is_retryable() => {
                format!("{}. Please try again.", err)
            }
            AppError::Configuration(_) => "Payments are not available right now".to_string(),
            AppError::Other(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        (
            status,
            StdResponse::<(), String> {
                data: None,
                message: Some(message),
            },
        )
            .into_response()
    }
}
