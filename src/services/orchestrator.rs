use std::{collections::BTreeMap, sync::Arc};

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::{
    api::gateway::{CreateIntent, GatewayError, PaymentGateway},
    app_error::AppError,
    domain::{AttemptStatus, Currency, Money, PaymentMethod, PaymentStatus},
    models::{CreatePaymentEntity, OrderEntity, PaymentEntity},
    services::audit::{AuditEntry, AuditOutcome, AuditRecorder},
    stores::OrderStore,
};

#[derive(Debug, Clone)]
pub struct CreatePayment {
    pub order_id: i32,
    pub actor_id: Option<i32>,
    pub amount: Decimal,
    pub method: PaymentMethod,
    /// Gateway name; the default gateway is used when absent.
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct PaymentOutcome {
    pub success: bool,
    pub payment_ref: Option<String>,
    pub client_secret: Option<String>,
    pub status: PaymentStatus,
}

enum OpenAttempt {
    Reuse(Processed),
    Closed(AttemptStatus),
}

struct Processed {
    outcome: PaymentOutcome,
    before: Value,
    after: Value,
    description: String,
}

/// Deterministic per attempt number: retrying after an unknown outcome reuses
/// the key, so the processor returns the original intent instead of charging
/// again.
pub fn idempotency_key(order_id: i32, attempt: i64) -> String {
    format!("order-{}-attempt-{}", order_id, attempt)
}

pub struct PaymentOrchestrator {
    store: Arc<dyn OrderStore>,
    audit: AuditRecorder,
    currency: Currency,
    gateways: Vec<Arc<dyn PaymentGateway>>,
}

impl PaymentOrchestrator {
    pub fn new(store: Arc<dyn OrderStore>, audit: AuditRecorder, currency: Currency) -> Self {
        Self {
            store,
            audit,
            currency,
            gateways: Vec::new(),
        }
    }

    /// Registers a gateway. The first one registered is the default.
    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateways.push(gateway);
        self
    }

    /// Starts a payment for an order. Exactly one audit record is written per
    /// call, whatever the result.
    pub async fn create_payment(&self, request: CreatePayment) -> Result<PaymentOutcome, AppError> {
        let result = self.process(&request).await;

        let entry = AuditEntry::new(request.actor_id, "create_payment", "orders", request.order_id);
        let entry = match &result {
            Ok(processed) => entry
                .before(processed.before.clone())
                .after(processed.after.clone())
                .description(processed.description.clone()),
            Err(err) => entry.outcome(audit_outcome(err)).error(err),
        };
        self.audit.record(entry).await;

        result.map(|processed| processed.outcome)
    }

    async fn process(&self, request: &CreatePayment) -> Result<Processed, AppError> {
        let amount = Money::from_major(request.amount, self.currency.clone())
            .map_err(|err| AppError::Validation(err.to_string()))?;

        let order = self
            .store
            .find_order(request.order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Order #{}", request.order_id)))?;

        if order.payment_status()? != PaymentStatus::Pending {
            return Err(AppError::Validation(format!(
                "Order #{} is already {}",
                order.id, order.payment_status
            )));
        }
        if amount.minor() != order.total_amount_minor {
            return Err(AppError::Validation(format!(
                "Amount {} does not match the total of order #{}",
                amount, order.id
            )));
        }

        if !request.method.requires_gateway() {
            let after = self
                .store
                .set_payment_method(order.id, request.method)
                .await?
                .ok_or_else(|| {
                    AppError::Validation(format!("Order #{} is no longer pending payment", order.id))
                })?;

            info!("Order #{} will be paid in {}", order.id, request.method);
            return Ok(Processed {
                outcome: PaymentOutcome {
                    success: true,
                    payment_ref: None,
                    client_secret: None,
                    status: PaymentStatus::Pending,
                },
                before: order.snapshot(),
                after: after.snapshot(),
                description: format!("Payment method set to {}", request.method),
            });
        }

        let gateway = self.resolve_gateway(request.gateway.as_deref())?;

        let mut closed_stale = None;
        if let Some(open) = self.store.open_attempt(order.id).await? {
            match self.check_open_attempt(&order, &open).await? {
                OpenAttempt::Reuse(processed) => return Ok(processed),
                OpenAttempt::Closed(status) => {
                    closed_stale = Some(format!("stale intent {} was {}", open.provider_ref, status))
                }
            }
        }

        let attempt = self.store.count_attempts(order.id).await? + 1;
        let key = idempotency_key(order.id, attempt);

        let metadata = BTreeMap::from([
            ("consumer_id".to_string(), order.consumer_id.to_string()),
            ("producer_id".to_string(), order.producer_id.to_string()),
        ]);

        let intent = gateway
            .create_intent(CreateIntent {
                order_id: order.id,
                amount: amount.clone(),
                idempotency_key: key.clone(),
                metadata,
            })
            .await
            .inspect_err(|err| {
                warn!(
                    order_id = order.id,
                    gateway = gateway.name(),
                    idempotency_key = %key,
                    retryable = err.is_retryable(),
                    "Payment intent creation failed: {}",
                    err
                )
            })?;

        let recorded = self
            .store
            .record_attempt(
                CreatePaymentEntity {
                    order_id: order.id,
                    provider: gateway.name().to_string(),
                    provider_ref: intent.id.clone(),
                    amount_minor: amount.minor(),
                    currency: amount.currency().code().to_string(),
                    status: AttemptStatus::Created.as_str().to_string(),
                    idempotency_key: key.clone(),
                },
                request.method,
            )
            .await;

        let (_, after) = recorded.inspect_err(|err| {
            error!(
                order_id = order.id,
                intent_id = %intent.id,
                manual_reconciliation = true,
                "Payment intent was created but could not be recorded: {}",
                err
            )
        })?;

        info!(
            "Order #{} has a new payment intent {} via {}",
            order.id,
            intent.id,
            gateway.name()
        );

        Ok(Processed {
            outcome: PaymentOutcome {
                success: true,
                payment_ref: Some(intent.id.clone()),
                client_secret: intent.client_secret,
                status: PaymentStatus::Pending,
            },
            before: order.snapshot(),
            after: after.snapshot(),
            description: match closed_stale {
                Some(note) => format!(
                    "Payment intent {} created via {} (attempt {}); {}",
                    intent.id,
                    gateway.name(),
                    attempt,
                    note
                ),
                None => format!(
                    "Payment intent {} created via {} (attempt {})",
                    intent.id,
                    gateway.name(),
                    attempt
                ),
            },
        })
    }

    /// An order has at most one payable intent. A still-open one is handed
    /// back to the client; one the processor already closed is closed locally
    /// so a new attempt can start.
    async fn check_open_attempt(
        &self,
        order: &OrderEntity,
        open: &PaymentEntity,
    ) -> Result<OpenAttempt, AppError> {
        let gateway = self
            .gateways
            .iter()
            .find(|gateway| gateway.name().eq_ignore_ascii_case(&open.provider))
            .ok_or_else(|| {
                AppError::Configuration(format!(
                    "order #{} has an open {} payment but that gateway is not registered",
                    order.id, open.provider
                ))
            })?;

        let intent = gateway
            .retrieve_intent(&open.provider_ref)
            .await
            .inspect_err(|err| {
                warn!(
                    order_id = order.id,
                    intent_id = %open.provider_ref,
                    "Could not check the open payment intent: {}",
                    err
                )
            })?;

        match intent.status.terminal_outcome() {
            None => {
                info!(
                    "Order #{} already has open payment intent {}, reusing it",
                    order.id, open.provider_ref
                );
                Ok(OpenAttempt::Reuse(Processed {
                    outcome: PaymentOutcome {
                        success: true,
                        payment_ref: Some(intent.id),
                        client_secret: intent.client_secret,
                        status: PaymentStatus::Pending,
                    },
                    before: order.snapshot(),
                    after: order.snapshot(),
                    description: format!("Reused open payment intent {}", open.provider_ref),
                }))
            }
            Some(AttemptStatus::Succeeded) => Err(AppError::Validation(format!(
                "Order #{} has a successful payment {} awaiting confirmation",
                order.id, open.provider_ref
            ))),
            Some(status) => {
                self.store
                    .close_attempt(&open.provider_ref, status, None)
                    .await?;
                info!(
                    "Closed stale payment intent {} of order #{} ({})",
                    open.provider_ref, order.id, status
                );
                Ok(OpenAttempt::Closed(status))
            }
        }
    }

    fn resolve_gateway(&self, name: Option<&str>) -> Result<&Arc<dyn PaymentGateway>, AppError> {
        match name {
            Some(name) => self
                .gateways
                .iter()
                .find(|gateway| gateway.name().eq_ignore_ascii_case(name))
                .ok_or_else(|| AppError::Validation(format!("Unknown payment gateway '{}'", name))),
            None => self
                .gateways
                .first()
                .ok_or_else(|| AppError::Configuration("no payment gateway registered".into())),
        }
    }
}

fn audit_outcome(err: &AppError) -> AuditOutcome {
    match err {
        AppError::Validation(_)
        | AppError::NotFound(_)
        | AppError::Gateway(GatewayError::Rejected { .. }) => AuditOutcome::Failure,
        _ => AuditOutcome::Error,
    }
}
