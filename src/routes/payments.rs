use axum::{
    Extension, Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    app_error::{AppError, StdResponse},
    app_state::AppState,
    domain::PaymentMethod,
    middleware::{self, Actor},
    services::{
        confirmation::ConfirmationResponse,
        orchestrator::{CreatePayment, PaymentOutcome},
        webhook::{SIGNATURE_HEADER, WebhookAck},
    },
};

/// Defines payment routes with OpenAPI specs. The webhook route sits outside
/// the actor layer since the processor is not a user.
pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    let client_routes = OpenApiRouter::new()
        .routes(utoipa_axum::routes!(create_payment))
        .routes(utoipa_axum::routes!(confirm_payment))
        .route_layer(axum::middleware::from_fn(middleware::actor_identity));

    OpenApiRouter::new()
        .merge(client_routes)
        .routes(utoipa_axum::routes!(payment_webhook))
}

#[derive(Deserialize, ToSchema)]
pub struct CreatePaymentReq {
    pub order_id: i32,
    /// Amount in major units of the service currency.
    #[schema(value_type = f64)]
    pub amount: Decimal,
    pub method: PaymentMethod,
    /// Gateway name, e.g. `stripe`. Defaults to the primary gateway.
    pub gateway: Option<String>,
}

/// Start paying an order, in cash or through a payment gateway.
#[utoipa::path(
    post,
    path = "/payments",
    tags = ["Payments"],
    request_body = CreatePaymentReq,
    params(
        ("x-user-id" = Option<i32>, Header, description = "Authenticated user id")
    ),
    responses(
        (status = 200, description = "Payment created successfully", body = StdResponse<PaymentOutcome, String>),
        (status = 400, description = "Invalid amount or order state"),
        (status = 402, description = "Payment rejected by the processor"),
        (status = 404, description = "Order not found"),
        (status = 502, description = "Payment gateway unavailable"),
        (status = 504, description = "Payment gateway timed out")
    )
)]
async fn create_payment(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<CreatePaymentReq>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .orchestrator
        .create_payment(CreatePayment {
            order_id: body.order_id,
            actor_id: actor.0,
            amount: body.amount,
            method: body.method,
            gateway: body.gateway,
        })
        .await?;

    Ok(StdResponse {
        data: Some(outcome),
        message: Some("Payment created successfully"),
    })
}

/// Receive a signed event from the payment processor.
#[utoipa::path(
    post,
    path = "/payments/webhook",
    tags = ["Payments"],
    request_body(content = String, description = "Raw event payload", content_type = "application/json"),
    params(
        ("stripe-signature" = String, Header, description = "Processor signature header")
    ),
    responses(
        (status = 200, description = "Event acknowledged", body = WebhookAck),
        (status = 400, description = "Invalid signature or payload"),
        (status = 503, description = "Order store unavailable, redeliver later")
    )
)]
async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let ack = state.webhooks.receive(&body, signature).await?;
    Ok(Json(ack))
}

#[derive(Deserialize, ToSchema)]
pub struct ConfirmPaymentReq {
    pub payment_intent_id: String,
    /// State reported by the client SDK. Informational only.
    pub estado: Option<String>,
    pub order_id: i32,
}

/// Ask the service to re-check a payment after the client finished checkout.
#[utoipa::path(
    post,
    path = "/payments/confirm",
    tags = ["Payments"],
    request_body = ConfirmPaymentReq,
    params(
        ("x-user-id" = Option<i32>, Header, description = "Authenticated user id")
    ),
    responses(
        (status = 200, description = "Payment state checked", body = StdResponse<ConfirmationResponse, String>),
        (status = 400, description = "Intent does not belong to the order"),
        (status = 502, description = "Payment gateway unavailable")
    )
)]
async fn confirm_payment(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<ConfirmPaymentReq>,
) -> Result<impl IntoResponse, AppError> {
    let result = state
        .confirmations
        .confirm_from_client(
            &body.payment_intent_id,
            body.order_id,
            body.estado.as_deref(),
            actor.0,
        )
        .await?;

    Ok(StdResponse {
        data: Some(ConfirmationResponse {
            order_id: result.order_id().unwrap_or(body.order_id),
            status: result.label().to_string(),
            payment_status: result.payment_status(),
        }),
        message: Some("Payment state checked"),
    })
}
