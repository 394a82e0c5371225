use std::{fmt, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::error;

use crate::{
    db::DbPool,
    models::{AuditLogEntity, CreateAuditLogEntity},
    schema::audit_logs,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Error,
}

impl AuditOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::Error => "error",
        }
    }
}

/// One mutating action, captured whether or not it succeeded.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub actor_id: Option<i32>,
    pub action: String,
    pub table: String,
    pub entity_id: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub outcome: AuditOutcome,
    pub description: Option<String>,
}

impl AuditEntry {
    pub fn new(
        actor_id: Option<i32>,
        action: impl Into<String>,
        table: impl Into<String>,
        entity_id: impl ToString,
    ) -> Self {
        Self {
            actor_id,
            action: action.into(),
            table: table.into(),
            entity_id: entity_id.to_string(),
            before: None,
            after: None,
            outcome: AuditOutcome::Success,
            description: None,
        }
    }

    pub fn before(mut self, snapshot: Value) -> Self {
        self.before = Some(snapshot);
        self
    }

    pub fn after(mut self, snapshot: Value) -> Self {
        self.after = Some(snapshot);
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn error(mut self, err: &dyn fmt::Display) -> Self {
        self.description = Some(err.to_string());
        self
    }
}

impl From<&AuditEntry> for CreateAuditLogEntity {
    fn from(entry: &AuditEntry) -> Self {
        Self {
            actor_id: entry.actor_id,
            action: entry.action.clone(),
            table_name: entry.table.clone(),
            entity_id: entry.entity_id.clone(),
            before_snapshot: entry.before.clone(),
            after_snapshot: entry.after.clone(),
            outcome: entry.outcome.as_str().to_string(),
            description: entry.description.clone(),
        }
    }
}

/// Append-only destination for audit records. There is deliberately no update
/// or delete operation.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<()>;
}

/// Infallible front for an [`AuditSink`]: sink failures are logged and dropped.
#[derive(Clone)]
pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
}

impl AuditRecorder {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub async fn record(&self, entry: AuditEntry) {
        if let Err(err) = self.sink.append(&entry).await {
            error!(
                action = %entry.action,
                table = %entry.table,
                entity_id = %entry.entity_id,
                outcome = entry.outcome.as_str(),
                "Failed to write audit record: {:#}",
                err
            );
        }
    }
}

pub struct PgAuditSink {
    pool: DbPool,
}

impl PgAuditSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let conn = &mut self
            .pool
            .get()
            .await
            .context("Failed to obtain a DB connection pool")?;

        diesel::insert_into(audit_logs::table)
            .values(CreateAuditLogEntity::from(entry))
            .execute(conn)
            .await
            .context("Failed to insert audit log")?;

        Ok(())
    }
}

/// Keeps records in memory; ids are assigned sequentially.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditLogEntity>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditLogEntity> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut records = self.records.lock().await;
        let row = CreateAuditLogEntity::from(entry);
        let id = records.len() as i64 + 1;
        records.push(AuditLogEntity {
            id,
            actor_id: row.actor_id,
            action: row.action,
            table_name: row.table_name,
            entity_id: row.entity_id,
            before_snapshot: row.before_snapshot,
            after_snapshot: row.after_snapshot,
            outcome: row.outcome,
            description: row.description,
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn append(&self, _entry: &AuditEntry) -> Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn sink_failures_never_reach_the_caller() {
        let recorder = AuditRecorder::new(Arc::new(BrokenSink));
        recorder
            .record(AuditEntry::new(Some(7), "create_payment", "orders", 42))
            .await;
    }

    #[tokio::test]
    async fn records_are_appended_in_order() {
        let sink = Arc::new(MemoryAuditSink::new());
        let recorder = AuditRecorder::new(sink.clone());

        recorder
            .record(
                AuditEntry::new(Some(7), "create_payment", "orders", 42)
                    .outcome(AuditOutcome::Failure)
                    .error(&"Amount must be greater than zero"),
            )
            .await;
        recorder
            .record(AuditEntry::new(None, "confirm_payment", "orders", 42))
            .await;

        let records = sink.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, "failure");
        assert_eq!(
            records[0].description.as_deref(),
            Some("Amount must be greater than zero")
        );
        assert_eq!(records[1].actor_id, None);
        assert_eq!(records[1].id, 2);
    }
}
