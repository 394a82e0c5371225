pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use diesel::result::{DatabaseErrorKind, Error as DieselError};

use crate::{
    domain::{AttemptStatus, FulfillmentStatus, PaymentMethod, StatusError},
    models::{CreatePaymentEntity, OrderEntity, PaymentEntity},
};

pub use memory::MemoryOrderStore;
pub use postgres::PgOrderStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Database(#[from] diesel::result::Error),

    #[error(transparent)]
    CorruptStatus(#[from] StatusError),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            StoreError::Database(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _))
        )
    }
}

/// Result of a guarded `pending -> paid` write.
#[derive(Debug, Clone)]
pub enum PaidTransition {
    Applied {
        before: OrderEntity,
        after: OrderEntity,
        item_count: i64,
        /// The local attempt for the paying intent, as left by the write.
        attempt: Option<PaymentEntity>,
    },
    /// Redelivery for the intent that already paid the order.
    AlreadyPaid(OrderEntity),
    /// The order was paid by another intent (or settled without one): this
    /// success is a second charge.
    PaidByOtherIntent {
        order: OrderEntity,
        attempt: Option<PaymentEntity>,
    },
    /// The order is in a payment state that cannot move to paid (e.g. refunded).
    Ineligible(OrderEntity),
    OrderMissing,
}

/// What a successful payment on `provider_ref` does to `order`, decided by the
/// payment and fulfillment transition tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PaidPlan {
    Apply { fulfillment: FulfillmentStatus },
    Redelivery,
    OtherIntent,
    Ineligible,
}

pub(crate) fn plan_paid(order: &OrderEntity, provider_ref: &str) -> Result<PaidPlan, StoreError> {
    let target = AttemptStatus::Succeeded.payment_status();

    match order.payment_status()?.transition(target) {
        Ok(Some(_)) => {
            // Fulfillment only cascades out of pending; later stages stay put.
            let current = order.fulfillment_status()?;
            let fulfillment = current
                .transition(FulfillmentStatus::Confirmed)
                .ok()
                .flatten()
                .unwrap_or(current);
            Ok(PaidPlan::Apply { fulfillment })
        }
        Ok(None) if order.paid_provider_ref.as_deref() == Some(provider_ref) => {
            Ok(PaidPlan::Redelivery)
        }
        Ok(None) => Ok(PaidPlan::OtherIntent),
        Err(_) => Ok(PaidPlan::Ineligible),
    }
}

#[derive(Debug, Clone)]
pub struct AttemptTransition {
    pub before: PaymentEntity,
    pub after: PaymentEntity,
}

/// Persistence port for orders and their payment attempts.
///
/// Every state-changing method is a conditional write: it only applies when the
/// current row is still eligible, so concurrent duplicates observe a no-op.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_order(&self, order_id: i32) -> Result<Option<OrderEntity>, StoreError>;

    async fn count_attempts(&self, order_id: i32) -> Result<i64, StoreError>;

    async fn find_attempt(&self, provider_ref: &str) -> Result<Option<PaymentEntity>, StoreError>;

    /// Most recent attempt of the order still in `created`.
    async fn open_attempt(&self, order_id: i32) -> Result<Option<PaymentEntity>, StoreError>;

    /// Records the chosen method while the order is still pending payment.
    async fn set_payment_method(
        &self,
        order_id: i32,
        method: PaymentMethod,
    ) -> Result<Option<OrderEntity>, StoreError>;

    /// Inserts a `created` attempt and stamps the method on the order atomically.
    /// Recording an intent that is already stored for the same order returns
    /// the stored attempt.
    async fn record_attempt(
        &self,
        attempt: CreatePaymentEntity,
        method: PaymentMethod,
    ) -> Result<(PaymentEntity, OrderEntity), StoreError>;

    /// `pending -> paid` plus `pending -> confirmed` fulfillment cascade, and the
    /// matching attempt `created -> succeeded`. The paying intent is stored on
    /// the order so a success on any other intent is told apart from a
    /// redelivery.
    async fn confirm_paid(
        &self,
        order_id: i32,
        provider_ref: &str,
    ) -> Result<PaidTransition, StoreError>;

    /// Moves a `created` attempt to a terminal failure state. Order payment
    /// status is left untouched.
    async fn close_attempt(
        &self,
        provider_ref: &str,
        status: AttemptStatus,
        failure_reason: Option<String>,
    ) -> Result<Option<AttemptTransition>, StoreError>;
}
