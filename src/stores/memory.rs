use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    domain::{AttemptStatus, FulfillmentStatus, PaymentMethod, PaymentStatus},
    models::{CreatePaymentEntity, OrderEntity, PaymentEntity},
    stores::{AttemptTransition, OrderStore, PaidPlan, PaidTransition, StoreError, plan_paid},
};

#[derive(Default)]
struct MemoryState {
    orders: HashMap<i32, OrderEntity>,
    item_quantities: HashMap<i32, Vec<i32>>,
    payments: HashMap<String, PaymentEntity>,
}

/// In-process order store with the same conditional-write semantics as the
/// Postgres one. Used for local runs and tests.
#[derive(Default)]
pub struct MemoryOrderStore {
    state: Mutex<MemoryState>,
    writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a pending order as checkout would.
    pub async fn insert_order(
        &self,
        order_id: i32,
        consumer_id: i32,
        producer_id: i32,
        total_amount_minor: i64,
        item_quantities: &[i32],
    ) -> OrderEntity {
        let now = Utc::now();
        let order = OrderEntity {
            id: order_id,
            consumer_id,
            producer_id,
            total_amount_minor,
            fulfillment_status: FulfillmentStatus::Pending.as_str().to_string(),
            payment_status: PaymentStatus::Pending.as_str().to_string(),
            payment_method: None,
            paid_provider_ref: None,
            created_at: now,
            updated_at: now,
        };

        let mut state = self.state.lock().await;
        state.orders.insert(order_id, order.clone());
        state
            .item_quantities
            .insert(order_id, item_quantities.to_vec());
        order
    }

    /// Number of successful state-changing writes performed so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Simulates a lost database connection.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn attempts_for(&self, order_id: i32) -> Vec<PaymentEntity> {
        let state = self.state.lock().await;
        state
            .payments
            .values()
            .filter(|payment| payment.order_id == order_id)
            .cloned()
            .collect()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn find_order(&self, order_id: i32) -> Result<Option<OrderEntity>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.orders.get(&order_id).cloned())
    }

    async fn count_attempts(&self, order_id: i32) -> Result<i64, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let count = state
            .payments
            .values()
            .filter(|payment| payment.order_id == order_id)
            .count();
        Ok(count as i64)
    }

    async fn find_attempt(&self, provider_ref: &str) -> Result<Option<PaymentEntity>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.payments.get(provider_ref).cloned())
    }

    async fn open_attempt(&self, order_id: i32) -> Result<Option<PaymentEntity>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut open = Vec::new();
        for payment in state.payments.values().filter(|p| p.order_id == order_id) {
            if payment.status()? == AttemptStatus::Created {
                open.push(payment);
            }
        }
        Ok(open.into_iter().max_by_key(|p| p.created_at).cloned())
    }

    async fn set_payment_method(
        &self,
        order_id: i32,
        method: PaymentMethod,
    ) -> Result<Option<OrderEntity>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(order) = state.orders.get_mut(&order_id) else {
            return Ok(None);
        };
        if order.payment_status()? != PaymentStatus::Pending {
            return Ok(None);
        }

        order.payment_method = Some(method.as_str().to_string());
        order.updated_at = Utc::now();
        self.wrote();
        Ok(Some(order.clone()))
    }

    async fn record_attempt(
        &self,
        attempt: CreatePaymentEntity,
        method: PaymentMethod,
    ) -> Result<(PaymentEntity, OrderEntity), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state.payments.get(&attempt.provider_ref).cloned() {
            if existing.order_id != attempt.order_id {
                return Err(StoreError::Database(diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    Box::new(format!("duplicate provider_ref {}", attempt.provider_ref)),
                )));
            }
            let order = state
                .orders
                .get(&attempt.order_id)
                .cloned()
                .ok_or(StoreError::Database(diesel::result::Error::NotFound))?;
            return Ok((existing, order));
        }
        let Some(order) = state.orders.get_mut(&attempt.order_id) else {
            return Err(StoreError::Database(diesel::result::Error::NotFound));
        };

        let now = Utc::now();
        order.payment_method = Some(method.as_str().to_string());
        order.updated_at = now;
        let order = order.clone();

        let payment = PaymentEntity {
            id: Uuid::new_v4(),
            order_id: attempt.order_id,
            provider: attempt.provider,
            provider_ref: attempt.provider_ref,
            amount_minor: attempt.amount_minor,
            currency: attempt.currency,
            status: attempt.status,
            idempotency_key: attempt.idempotency_key,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        state
            .payments
            .insert(payment.provider_ref.clone(), payment.clone());
        self.wrote();

        Ok((payment, order))
    }

    async fn confirm_paid(
        &self,
        order_id: i32,
        provider_ref: &str,
    ) -> Result<PaidTransition, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let Some(before) = state.orders.get(&order_id).cloned() else {
            return Ok(PaidTransition::OrderMissing);
        };
        let plan = plan_paid(&before, provider_ref)?;
        if plan == PaidPlan::Redelivery {
            return Ok(PaidTransition::AlreadyPaid(before));
        }
        if plan == PaidPlan::Ineligible {
            return Ok(PaidTransition::Ineligible(before));
        }

        // The processor reports the intent succeeded; record that on a still
        // open attempt whatever happens to the order.
        let mut attempt = None;
        if let Some(payment) = state.payments.get_mut(provider_ref) {
            if payment.order_id == order_id {
                if payment.status()?.can_transition_to(AttemptStatus::Succeeded) {
                    payment.status = AttemptStatus::Succeeded.as_str().to_string();
                    payment.updated_at = now;
                    self.wrote();
                }
                attempt = Some(payment.clone());
            }
        }

        let PaidPlan::Apply { fulfillment } = plan else {
            return Ok(PaidTransition::PaidByOtherIntent {
                order: before,
                attempt,
            });
        };

        let item_count = state
            .item_quantities
            .get(&order_id)
            .map(|quantities| quantities.iter().map(|q| i64::from(*q)).sum::<i64>())
            .unwrap_or(0);

        let Some(order) = state.orders.get_mut(&order_id) else {
            return Ok(PaidTransition::OrderMissing);
        };
        order.payment_status = PaymentStatus::Paid.as_str().to_string();
        order.fulfillment_status = fulfillment.as_str().to_string();
        order.paid_provider_ref = Some(provider_ref.to_string());
        order.updated_at = now;
        let after = order.clone();
        self.wrote();

        Ok(PaidTransition::Applied {
            before,
            after,
            item_count,
            attempt,
        })
    }

    async fn close_attempt(
        &self,
        provider_ref: &str,
        status: AttemptStatus,
        failure_reason: Option<String>,
    ) -> Result<Option<AttemptTransition>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(payment) = state.payments.get_mut(provider_ref) else {
            return Ok(None);
        };
        if !payment.status()?.can_transition_to(status) {
            return Ok(None);
        }

        let before = payment.clone();
        payment.status = status.as_str().to_string();
        payment.failure_reason = failure_reason;
        payment.updated_at = Utc::now();
        self.wrote();

        Ok(Some(AttemptTransition {
            before,
            after: payment.clone(),
        }))
    }
}
