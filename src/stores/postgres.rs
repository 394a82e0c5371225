use async_trait::async_trait;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl, pooled_connection::bb8::PooledConnection};

use crate::{
    db::DbPool,
    domain::{AttemptStatus, PaymentMethod, PaymentStatus},
    models::{CreatePaymentEntity, OrderEntity, PaymentEntity},
    schema::{order_items, orders, payments},
    stores::{AttemptTransition, OrderStore, PaidPlan, PaidTransition, StoreError, plan_paid},
};

#[derive(Clone)]
pub struct PgOrderStore {
    pool: DbPool,
}

impl PgOrderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PooledConnection<'_, AsyncPgConnection>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to obtain a DB connection: {}", e)))
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn find_order(&self, order_id: i32) -> Result<Option<OrderEntity>, StoreError> {
        let conn = &mut self.conn().await?;

        let order = orders::table
            .find(order_id)
            .select(OrderEntity::as_select())
            .first(conn)
            .await
            .optional()?;

        Ok(order)
    }

    async fn count_attempts(&self, order_id: i32) -> Result<i64, StoreError> {
        let conn = &mut self.conn().await?;

        let count = payments::table
            .filter(payments::order_id.eq(order_id))
            .count()
            .get_result(conn)
            .await?;

        Ok(count)
    }

    async fn find_attempt(&self, provider_ref: &str) -> Result<Option<PaymentEntity>, StoreError> {
        let conn = &mut self.conn().await?;

        let attempt = payments::table
            .filter(payments::provider_ref.eq(provider_ref))
            .select(PaymentEntity::as_select())
            .first(conn)
            .await
            .optional()?;

        Ok(attempt)
    }

    async fn open_attempt(&self, order_id: i32) -> Result<Option<PaymentEntity>, StoreError> {
        let conn = &mut self.conn().await?;

        let attempt = payments::table
            .filter(payments::order_id.eq(order_id))
            .filter(payments::status.eq(AttemptStatus::Created.as_str()))
            .order(payments::created_at.desc())
            .select(PaymentEntity::as_select())
            .first(conn)
            .await
            .optional()?;

        Ok(attempt)
    }

    async fn set_payment_method(
        &self,
        order_id: i32,
        method: PaymentMethod,
    ) -> Result<Option<OrderEntity>, StoreError> {
        let conn = &mut self.conn().await?;

        let updated = diesel::update(
            orders::table
                .find(order_id)
                .filter(orders::payment_status.eq(PaymentStatus::Pending.as_str())),
        )
        .set((
            orders::payment_method.eq(method.as_str()),
            orders::updated_at.eq(diesel::dsl::now),
        ))
        .returning(OrderEntity::as_returning())
        .get_result(conn)
        .await
        .optional()?;

        Ok(updated)
    }

    async fn record_attempt(
        &self,
        attempt: CreatePaymentEntity,
        method: PaymentMethod,
    ) -> Result<(PaymentEntity, OrderEntity), StoreError> {
        let conn = &mut self.conn().await?;
        let order_id = attempt.order_id;
        let provider_ref = attempt.provider_ref.clone();

        let result = conn
            .transaction(move |conn| {
                Box::pin(async move {
                    let order_id = attempt.order_id;
                    let payment = diesel::insert_into(payments::table)
                        .values(attempt)
                        .returning(PaymentEntity::as_returning())
                        .get_result(conn)
                        .await?;

                    let order = diesel::update(orders::table.find(order_id))
                        .set((
                            orders::payment_method.eq(method.as_str()),
                            orders::updated_at.eq(diesel::dsl::now),
                        ))
                        .returning(OrderEntity::as_returning())
                        .get_result(conn)
                        .await?;

                    Ok::<(PaymentEntity, OrderEntity), StoreError>((payment, order))
                })
            })
            .await;

        let err = match result {
            Ok(recorded) => return Ok(recorded),
            Err(err) if err.is_unique_violation() => err,
            Err(err) => return Err(err),
        };

        // A concurrent create with the same idempotency key got the same
        // intent back and recorded it first.
        let existing: Option<PaymentEntity> = payments::table
            .filter(payments::provider_ref.eq(&provider_ref))
            .select(PaymentEntity::as_select())
            .first(conn)
            .await
            .optional()?;

        match existing {
            Some(existing) if existing.order_id == order_id => {
                let order = orders::table
                    .find(order_id)
                    .select(OrderEntity::as_select())
                    .first(conn)
                    .await?;
                Ok((existing, order))
            }
            _ => Err(err),
        }
    }

    async fn confirm_paid(
        &self,
        order_id: i32,
        provider_ref: &str,
    ) -> Result<PaidTransition, StoreError> {
        let conn = &mut self.conn().await?;
        let provider_ref = provider_ref.to_owned();

        conn.transaction(move |conn| {
            Box::pin(async move {
                // Row lock serialises concurrent deliveries for the same order.
                let before: Option<OrderEntity> = orders::table
                    .find(order_id)
                    .select(OrderEntity::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?;

                let Some(before) = before else {
                    return Ok(PaidTransition::OrderMissing);
                };

                let plan = plan_paid(&before, &provider_ref)?;
                match plan {
                    PaidPlan::Redelivery => return Ok(PaidTransition::AlreadyPaid(before)),
                    PaidPlan::Ineligible => return Ok(PaidTransition::Ineligible(before)),
                    PaidPlan::Apply { .. } | PaidPlan::OtherIntent => {}
                }

                let mut attempt: Option<PaymentEntity> = payments::table
                    .filter(payments::provider_ref.eq(&provider_ref))
                    .filter(payments::order_id.eq(order_id))
                    .select(PaymentEntity::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?;

                if let Some(current) = &attempt {
                    if current.status()?.can_transition_to(AttemptStatus::Succeeded) {
                        let updated = diesel::update(
                            payments::table
                                .find(current.id)
                                .filter(payments::status.eq(AttemptStatus::Created.as_str())),
                        )
                        .set((
                            payments::status.eq(AttemptStatus::Succeeded.as_str()),
                            payments::updated_at.eq(diesel::dsl::now),
                        ))
                        .returning(PaymentEntity::as_returning())
                        .get_result(conn)
                        .await?;
                        attempt = Some(updated);
                    }
                }

                let PaidPlan::Apply { fulfillment } = plan else {
                    return Ok(PaidTransition::PaidByOtherIntent {
                        order: before,
                        attempt,
                    });
                };

                let after = diesel::update(
                    orders::table
                        .find(order_id)
                        .filter(orders::payment_status.eq(PaymentStatus::Pending.as_str())),
                )
                .set((
                    orders::payment_status.eq(PaymentStatus::Paid.as_str()),
                    orders::fulfillment_status.eq(fulfillment.as_str()),
                    orders::paid_provider_ref.eq(&provider_ref),
                    orders::updated_at.eq(diesel::dsl::now),
                ))
                .returning(OrderEntity::as_returning())
                .get_result(conn)
                .await?;

                let item_count: Option<i64> = order_items::table
                    .filter(order_items::order_id.eq(order_id))
                    .select(diesel::dsl::sum(order_items::quantity))
                    .first(conn)
                    .await?;

                Ok::<PaidTransition, StoreError>(PaidTransition::Applied {
                    before,
                    after,
                    item_count: item_count.unwrap_or(0),
                    attempt,
                })
            })
        })
        .await
    }

    async fn close_attempt(
        &self,
        provider_ref: &str,
        status: AttemptStatus,
        failure_reason: Option<String>,
    ) -> Result<Option<AttemptTransition>, StoreError> {
        let conn = &mut self.conn().await?;
        let provider_ref = provider_ref.to_owned();

        conn.transaction(move |conn| {
            Box::pin(async move {
                let before: Option<PaymentEntity> = payments::table
                    .filter(payments::provider_ref.eq(&provider_ref))
                    .select(PaymentEntity::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?;

                let Some(before) = before else {
                    return Ok(None);
                };
                if !before.status()?.can_transition_to(status) {
                    return Ok(None);
                }

                let after = diesel::update(
                    payments::table
                        .find(before.id)
                        .filter(payments::status.eq(AttemptStatus::Created.as_str())),
                )
                .set((
                    payments::status.eq(status.as_str()),
                    payments::failure_reason.eq(failure_reason),
                    payments::updated_at.eq(diesel::dsl::now),
                ))
                .returning(PaymentEntity::as_returning())
                .get_result(conn)
                .await?;

                Ok::<Option<AttemptTransition>, StoreError>(Some(AttemptTransition { before, after }))
            })
        })
        .await
    }
}
