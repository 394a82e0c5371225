use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use diesel::SelectableHelper;
use diesel_async::RunQueryDsl;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    config::AmqpConfig,
    db::DbPool,
    domain::Money,
    models::{CreateNotificationEntity, NotificationEntity},
    schema::notifications,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentConfirmed,
    NewOrder,
}

impl NotificationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            NotificationKind::PaymentConfirmed => "payment_confirmed",
            NotificationKind::NewOrder => "new_order",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: i32,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub order_id: Option<i32>,
}

impl Notification {
    /// Sent to the buyer once the order is paid.
    pub fn payment_confirmed(consumer_id: i32, order_id: i32, total: &Money) -> Self {
        Self {
            user_id: consumer_id,
            kind: NotificationKind::PaymentConfirmed,
            title: "Pago confirmado".to_string(),
            message: format!("Tu pago de {} para el pedido #{} fue confirmado", total, order_id),
            order_id: Some(order_id),
        }
    }

    /// Sent to the seller once the order is paid and ready to prepare.
    pub fn new_order(producer_id: i32, order_id: i32, item_count: i64, total: &Money) -> Self {
        Self {
            user_id: producer_id,
            kind: NotificationKind::NewOrder,
            title: "Nuevo pedido listo".to_string(),
            message: format!(
                "Nuevo pedido listo: {} productos, total {}",
                item_count, total
            ),
            order_id: Some(order_id),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Exponential backoff for notification delivery.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay_ms as u64);

        delay.min(self.max_delay)
    }
}

async fn deliver_with_retry(
    sink: &dyn NotificationSink,
    policy: &RetryPolicy,
    notification: &Notification,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        match sink.deliver(notification).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= policy.max_retries => return Err(err),
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    user_id = notification.user_id,
                    kind = notification.kind.as_str(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Notification delivery failed, retrying: {:#}",
                    err
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Hands notifications to a background worker so the payment path never
/// waits on delivery.
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationDispatcher {
    pub fn spawn(sink: Arc<dyn NotificationSink>, policy: RetryPolicy) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();

        let worker = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                let sink = sink.clone();
                let policy = policy.clone();
                tokio::spawn(async move {
                    match deliver_with_retry(sink.as_ref(), &policy, &notification).await {
                        Ok(()) => info!(
                            "Notification '{}' delivered to user #{}",
                            notification.kind.as_str(),
                            notification.user_id
                        ),
                        Err(err) => error!(
                            user_id = notification.user_id,
                            order_id = ?notification.order_id,
                            kind = notification.kind.as_str(),
                            "Notification dropped after retries: {:#}",
                            err
                        ),
                    }
                });
            }
        });

        (Self { tx }, worker)
    }

    pub fn enqueue(&self, notification: Notification) {
        if let Err(err) = self.tx.send(notification) {
            error!(
                user_id = err.0.user_id,
                "Notification worker is gone, dropping notification"
            );
        }
    }
}

pub struct PgNotificationSink {
    pool: DbPool,
}

impl PgNotificationSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSink for PgNotificationSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let conn = &mut self
            .pool
            .get()
            .await
            .context("Failed to obtain a DB connection pool")?;

        let stored: NotificationEntity = diesel::insert_into(notifications::table)
            .values(CreateNotificationEntity {
                user_id: notification.user_id,
                kind: notification.kind.as_str().to_string(),
                title: notification.title.clone(),
                message: notification.message.clone(),
                order_id: notification.order_id,
            })
            .returning(NotificationEntity::as_returning())
            .get_result(conn)
            .await
            .context("Failed to insert notification")?;

        debug!("Stored notification #{} for user #{}", stored.id, stored.user_id);
        Ok(())
    }
}

/// Publishes notifications as JSON to a durable queue for the notification
/// service to pick up.
pub struct AmqpNotificationSink {
    // Dropping the connection closes the channel.
    _connection: Connection,
    channel: Channel,
    queue: String,
}

impl AmqpNotificationSink {
    pub async fn connect(config: &AmqpConfig) -> Result<Self> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to the AMQP broker")?;
        let channel = connection
            .create_channel()
            .await
            .context("Failed to open an AMQP channel")?;

        channel
            .queue_declare(
                config.notification_queue.as_str().into(),
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to declare queue {}", config.notification_queue))?;

        info!("Publishing notifications to queue '{}'", config.notification_queue);

        Ok(Self {
            _connection: connection,
            channel,
            queue: config.notification_queue.clone(),
        })
    }
}

#[async_trait]
impl NotificationSink for AmqpNotificationSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let payload = serde_json::to_vec(notification)?;

        self.channel
            .basic_publish(
                "".into(),
                self.queue.as_str().into(),
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await
            .context("Failed to publish notification")?
            .await
            .context("Broker did not confirm the notification")?;

        Ok(())
    }
}
