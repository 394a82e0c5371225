use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::{
    api::gateway::{IntentStatus, PaymentGateway, is_intent_id},
    app_error::AppError,
    domain::{AttemptStatus, Currency, Money, PaymentStatus},
    models::OrderEntity,
    services::{
        audit::{AuditEntry, AuditOutcome, AuditRecorder},
        notifications::{Notification, NotificationDispatcher},
    },
    stores::{OrderStore, PaidTransition},
};

/// Where a gateway outcome came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeSource {
    Webhook { event_id: String },
    ClientConfirm { actor_id: Option<i32> },
}

impl OutcomeSource {
    fn actor_id(&self) -> Option<i32> {
        match self {
            OutcomeSource::Webhook { .. } => None,
            OutcomeSource::ClientConfirm { actor_id } => *actor_id,
        }
    }

    fn describe(&self) -> String {
        match self {
            OutcomeSource::Webhook { event_id } => format!("webhook event {}", event_id),
            OutcomeSource::ClientConfirm { .. } => "client confirmation".to_string(),
        }
    }
}

/// A processor-verified statement about one payment intent.
#[derive(Debug, Clone)]
pub struct GatewayOutcome {
    pub intent_id: String,
    pub status: AttemptStatus,
    pub order_hint: Option<i32>,
    pub source: OutcomeSource,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationResult {
    /// The order moved `pending -> paid` because of this outcome.
    Paid { order_id: i32 },
    /// A failed or canceled attempt was closed; the order stays pending.
    AttemptClosed { order_id: i32, status: AttemptStatus },
    /// Already applied by an earlier delivery.
    Duplicate { order_id: i32 },
    /// A second intent succeeded for an order that was already paid.
    DuplicateCharge { order_id: i32 },
    /// The order is in a state this outcome may not change.
    Ineligible { order_id: i32, payment_status: PaymentStatus },
    /// The processor has not reached a terminal state yet.
    Pending { order_id: i32 },
    /// Nothing to apply for a resolved order.
    Ignored { order_id: i32 },
    /// No order could be tied to the intent; needs manual reconciliation.
    Unresolved { intent_id: String },
}

impl ConfirmationResult {
    pub fn label(&self) -> &'static str {
        match self {
            ConfirmationResult::Paid { .. } | ConfirmationResult::AttemptClosed { .. } => {
                "processed"
            }
            ConfirmationResult::Duplicate { .. } => "duplicate",
            ConfirmationResult::DuplicateCharge { .. } => "duplicate_charge",
            ConfirmationResult::Ineligible { .. } | ConfirmationResult::Ignored { .. } => "ignored",
            ConfirmationResult::Pending { .. } => "pending",
            ConfirmationResult::Unresolved { .. } => "unresolved",
        }
    }

    pub fn order_id(&self) -> Option<i32> {
        match self {
            ConfirmationResult::Paid { order_id }
            | ConfirmationResult::AttemptClosed { order_id, .. }
            | ConfirmationResult::Duplicate { order_id }
            | ConfirmationResult::DuplicateCharge { order_id }
            | ConfirmationResult::Ineligible { order_id, .. }
            | ConfirmationResult::Pending { order_id }
            | ConfirmationResult::Ignored { order_id } => Some(*order_id),
            ConfirmationResult::Unresolved { .. } => None,
        }
    }

    /// Order payment status after the outcome was applied, when known.
    pub fn payment_status(&self) -> Option<PaymentStatus> {
        match self {
            ConfirmationResult::Paid { .. }
            | ConfirmationResult::Duplicate { .. }
            | ConfirmationResult::DuplicateCharge { .. } => Some(PaymentStatus::Paid),
            ConfirmationResult::Ineligible { payment_status, .. } => Some(*payment_status),
            ConfirmationResult::AttemptClosed { .. } | ConfirmationResult::Pending { .. } => {
                Some(PaymentStatus::Pending)
            }
            ConfirmationResult::Ignored { .. } | ConfirmationResult::Unresolved { .. } => None,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ConfirmationResponse {
    pub order_id: i32,
    pub status: String,
    pub payment_status: Option<PaymentStatus>,
}

/// Applies gateway outcomes to orders and attempts. Shared by the webhook
/// receiver and the client confirmation endpoint.
pub struct ConfirmationHandler {
    store: Arc<dyn OrderStore>,
    gateway: Arc<dyn PaymentGateway>,
    audit: AuditRecorder,
    notifications: NotificationDispatcher,
    currency: Currency,
}

impl ConfirmationHandler {
    pub fn new(
        store: Arc<dyn OrderStore>,
        gateway: Arc<dyn PaymentGateway>,
        audit: AuditRecorder,
        notifications: NotificationDispatcher,
        currency: Currency,
    ) -> Self {
        Self {
            store,
            gateway,
            audit,
            notifications,
            currency,
        }
    }

    pub async fn apply(&self, outcome: GatewayOutcome) -> Result<ConfirmationResult, AppError> {
        let Some(order_id) = self.resolve_order(&outcome).await? else {
            return Ok(self.unresolved(&outcome, "no order could be resolved"));
        };

        match (outcome.status.payment_status(), outcome.status.is_terminal()) {
            (PaymentStatus::Paid, _) => self.apply_paid(order_id, &outcome).await,
            (_, true) => self.apply_closed(order_id, &outcome).await,
            (_, false) => Ok(ConfirmationResult::Pending { order_id }),
        }
    }

    /// Client-side confirmation. The client's reported state is never trusted:
    /// the intent is re-read from the processor and its status is applied.
    pub async fn confirm_from_client(
        &self,
        intent_id: &str,
        order_id: i32,
        reported_state: Option<&str>,
        actor_id: Option<i32>,
    ) -> Result<ConfirmationResult, AppError> {
        if intent_id.trim().is_empty() {
            return Err(AppError::Validation("payment_intent_id is required".into()));
        }
        if !is_intent_id(intent_id) {
            return Err(AppError::Validation(format!(
                "'{}' is not a payment intent id",
                intent_id
            )));
        }

        let intent = self.gateway.retrieve_intent(intent_id).await?;
        if intent.order_id() != Some(order_id) {
            return Err(AppError::Validation(format!(
                "Payment intent {} does not belong to order #{}",
                intent_id, order_id
            )));
        }

        if let Some(reported) = reported_state {
            let reported_status = serde_json::from_value::<IntentStatus>(reported.into()).ok();
            if reported_status != Some(intent.status) {
                warn!(
                    order_id,
                    intent_id,
                    reported,
                    actual = ?intent.status,
                    "Client-reported payment state differs from the processor"
                );
            }
        }

        let Some(status) = intent.status.terminal_outcome() else {
            return Ok(ConfirmationResult::Pending { order_id });
        };

        self.apply(GatewayOutcome {
            intent_id: intent.id,
            status,
            order_hint: Some(order_id),
            source: OutcomeSource::ClientConfirm { actor_id },
            failure_reason: None,
        })
        .await
    }

    /// Metadata first, then the local attempt, then one lookup at the
    /// processor. A conflicting local attempt is never overridden.
    async fn resolve_order(&self, outcome: &GatewayOutcome) -> Result<Option<i32>, AppError> {
        let attempt = self.store.find_attempt(&outcome.intent_id).await?;

        let candidate = match (outcome.order_hint, attempt.as_ref()) {
            (Some(hint), _) => Some(hint),
            (None, Some(attempt)) => Some(attempt.order_id),
            (None, None) => match self.gateway.retrieve_intent(&outcome.intent_id).await {
                Ok(intent) => intent.order_id(),
                Err(err) => {
                    warn!(
                        intent_id = %outcome.intent_id,
                        "Could not look up payment intent to resolve its order: {}",
                        err
                    );
                    None
                }
            },
        };

        let Some(order_id) = candidate else {
            return Ok(None);
        };

        if let Some(attempt) = attempt {
            if attempt.order_id != order_id {
                warn!(
                    intent_id = %outcome.intent_id,
                    claimed_order_id = order_id,
                    attempt_order_id = attempt.order_id,
                    manual_reconciliation = true,
                    "Payment intent is recorded against a different order"
                );
                return Ok(None);
            }
        } else if outcome.status == AttemptStatus::Succeeded {
            warn!(
                order_id,
                intent_id = %outcome.intent_id,
                "Successful payment for an intent with no local attempt"
            );
        }

        Ok(Some(order_id))
    }

    async fn apply_paid(
        &self,
        order_id: i32,
        outcome: &GatewayOutcome,
    ) -> Result<ConfirmationResult, AppError> {
        let transition = match self.store.confirm_paid(order_id, &outcome.intent_id).await {
            Ok(transition) => transition,
            Err(err) => {
                self.audit
                    .record(
                        AuditEntry::new(outcome.source.actor_id(), "confirm_payment", "orders", order_id)
                            .outcome(AuditOutcome::Error)
                            .error(&err),
                    )
                    .await;
                return Err(err.into());
            }
        };

        match transition {
            PaidTransition::Applied {
                before,
                after,
                item_count,
                attempt,
            } => {
                let mut description = format!(
                    "Payment {} confirmed by {}",
                    outcome.intent_id,
                    outcome.source.describe()
                );
                if let Some(attempt) = attempt.filter(|a| a.status != AttemptStatus::Succeeded.as_str()) {
                    warn!(
                        order_id,
                        intent_id = %outcome.intent_id,
                        attempt_status = %attempt.status,
                        manual_reconciliation = true,
                        "Order paid by an intent whose local attempt was already closed"
                    );
                    description.push_str(&format!("; local attempt was {}", attempt.status));
                }

                self.audit
                    .record(
                        AuditEntry::new(outcome.source.actor_id(), "confirm_payment", "orders", order_id)
                            .before(before.snapshot())
                            .after(after.snapshot())
                            .description(description),
                    )
                    .await;

                info!("Order #{} has been paid", order_id);
                self.notify_paid(&after, item_count);

                Ok(ConfirmationResult::Paid { order_id })
            }
            PaidTransition::AlreadyPaid(_) => {
                info!(
                    "Order #{} was already paid, ignoring {}",
                    order_id,
                    outcome.source.describe()
                );
                Ok(ConfirmationResult::Duplicate { order_id })
            }
            PaidTransition::PaidByOtherIntent { order, attempt } => {
                let paid_by = order.paid_provider_ref.as_deref().unwrap_or("no intent");
                error!(
                    order_id,
                    intent_id = %outcome.intent_id,
                    paid_by,
                    manual_reconciliation = true,
                    "Order was already paid, this intent is a second charge"
                );

                let mut entry = AuditEntry::new(
                    outcome.source.actor_id(),
                    "duplicate_charge",
                    "payments",
                    &outcome.intent_id,
                )
                .outcome(AuditOutcome::Failure)
                .before(order.snapshot())
                .description(format!(
                    "Intent {} succeeded for order #{} already paid by {} ({})",
                    outcome.intent_id,
                    order_id,
                    paid_by,
                    outcome.source.describe()
                ));
                if let Some(attempt) = attempt {
                    entry = entry.after(attempt.snapshot());
                }
                self.audit.record(entry).await;

                Ok(ConfirmationResult::DuplicateCharge { order_id })
            }
            PaidTransition::Ineligible(order) => {
                let payment_status = order.payment_status()?;
                warn!(
                    order_id,
                    intent_id = %outcome.intent_id,
                    payment_status = payment_status.as_str(),
                    "Order cannot move to paid, ignoring outcome"
                );
                Ok(ConfirmationResult::Ineligible {
                    order_id,
                    payment_status,
                })
            }
            PaidTransition::OrderMissing => Ok(self.unresolved(outcome, "order does not exist")),
        }
    }

    async fn apply_closed(
        &self,
        order_id: i32,
        outcome: &GatewayOutcome,
    ) -> Result<ConfirmationResult, AppError> {
        let action = match outcome.status {
            AttemptStatus::Canceled => "payment_attempt_canceled",
            _ => "payment_attempt_failed",
        };

        let closed = self
            .store
            .close_attempt(
                &outcome.intent_id,
                outcome.status,
                outcome.failure_reason.clone(),
            )
            .await;

        match closed {
            Ok(Some(transition)) => {
                self.audit
                    .record(
                        AuditEntry::new(
                            outcome.source.actor_id(),
                            action,
                            "payments",
                            &outcome.intent_id,
                        )
                        .before(transition.before.snapshot())
                        .after(transition.after.snapshot())
                        .description(
                            outcome
                                .failure_reason
                                .clone()
                                .unwrap_or_else(|| outcome.source.describe()),
                        ),
                    )
                    .await;

                info!(
                    "Payment attempt {} for order #{} is {}",
                    outcome.intent_id,
                    order_id,
                    outcome.status.as_str()
                );
                Ok(ConfirmationResult::AttemptClosed {
                    order_id,
                    status: outcome.status,
                })
            }
            Ok(None) => {
                let known = self.store.find_attempt(&outcome.intent_id).await?.is_some();
                if known {
                    Ok(ConfirmationResult::Duplicate { order_id })
                } else {
                    warn!(
                        order_id,
                        intent_id = %outcome.intent_id,
                        "No local attempt to close"
                    );
                    Ok(ConfirmationResult::Ignored { order_id })
                }
            }
            Err(err) => {
                self.audit
                    .record(
                        AuditEntry::new(
                            outcome.source.actor_id(),
                            action,
                            "payments",
                            &outcome.intent_id,
                        )
                        .outcome(AuditOutcome::Error)
                        .error(&err),
                    )
                    .await;
                Err(err.into())
            }
        }
    }

    fn notify_paid(&self, order: &OrderEntity, item_count: i64) {
        let total = match Money::from_minor(order.total_amount_minor, self.currency.clone()) {
            Ok(total) => total,
            Err(err) => {
                warn!(order_id = order.id, "Skipping paid notifications: {}", err);
                return;
            }
        };

        self.notifications
            .enqueue(Notification::payment_confirmed(order.consumer_id, order.id, &total));
        self.notifications.enqueue(Notification::new_order(
            order.producer_id,
            order.id,
            item_count,
            &total,
        ));
    }

    fn unresolved(&self, outcome: &GatewayOutcome, reason: &str) -> ConfirmationResult {
        let gap = AppError::ReconciliationGap {
            intent_id: outcome.intent_id.clone(),
        };
        warn!(
            intent_id = %outcome.intent_id,
            status = outcome.status.as_str(),
            source = %outcome.source.describe(),
            manual_reconciliation = true,
            "{} ({})",
            gap,
            reason
        );
        ConfirmationResult::Unresolved {
            intent_id: outcome.intent_id.clone(),
        }
    }
}
