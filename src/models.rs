use chrono::{DateTime, Utc};
use diesel::{
    Selectable,
    prelude::{Identifiable, Insertable, Queryable},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::domain::{AttemptStatus, FulfillmentStatus, PaymentMethod, PaymentStatus, StatusError};

// Orders

#[derive(Queryable, Selectable, Identifiable, Serialize, Deserialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OrderEntity {
    pub id: i32,
    pub consumer_id: i32,
    pub producer_id: i32,
    pub total_amount_minor: i64,
    pub fulfillment_status: String,
    pub payment_status: String,
    pub payment_method: Option<String>,
    /// Intent whose success moved the order to paid.
    pub paid_provider_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderEntity {
    pub fn payment_status(&self) -> Result<PaymentStatus, StatusError> {
        self.payment_status.parse()
    }

    pub fn fulfillment_status(&self) -> Result<FulfillmentStatus, StatusError> {
        self.fulfillment_status.parse()
    }

    pub fn payment_method(&self) -> Result<Option<PaymentMethod>, StatusError> {
        self.payment_method.as_deref().map(str::parse).transpose()
    }

    /// JSON snapshot used for audit before/after images.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// Payment attempts

#[derive(Queryable, Selectable, Identifiable, Serialize, Deserialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::payments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PaymentEntity {
    pub id: Uuid,
    pub order_id: i32,
    pub provider: String,
    pub provider_ref: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: String,
    pub idempotency_key: String,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentEntity {
    pub fn status(&self) -> Result<AttemptStatus, StatusError> {
        self.status.parse()
    }

    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Insertable, Serialize, Deserialize, Debug, Clone)]
#[diesel(table_name = crate::schema::payments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreatePaymentEntity {
    pub order_id: i32,
    pub provider: String,
    pub provider_ref: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: String,
    pub idempotency_key: String,
}

// Audit logs

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::audit_logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AuditLogEntity {
    pub id: i64,
    pub actor_id: Option<i32>,
    pub action: String,
    pub table_name: String,
    pub entity_id: String,
    pub before_snapshot: Option<Value>,
    pub after_snapshot: Option<Value>,
    pub outcome: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::audit_logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateAuditLogEntity {
    pub actor_id: Option<i32>,
    pub action: String,
    pub table_name: String,
    pub entity_id: String,
    pub before_snapshot: Option<Value>,
    pub after_snapshot: Option<Value>,
    pub outcome: String,
    pub description: Option<String>,
}

// Notifications

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::notifications)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NotificationEntity {
    pub id: i32,
    pub user_id: i32,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub order_id: Option<i32>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::notifications)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateNotificationEntity {
    pub user_id: i32,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub order_id: Option<i32>,
}
