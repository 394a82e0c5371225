#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use marketplace_payments::{
    api::gateway::{
        CreateIntent, GatewayError, IntentStatus, ORDER_ID_METADATA_KEY, PaymentGateway,
        PaymentIntent,
    },
    app_state::AppState,
    domain::Currency,
    routes,
    services::{
        audit::{AuditRecorder, MemoryAuditSink},
        confirmation::ConfirmationHandler,
        notifications::{Notification, NotificationDispatcher, NotificationSink, RetryPolicy},
        orchestrator::PaymentOrchestrator,
        webhook::{WebhookReceiver, compute_signature},
    },
    stores::MemoryOrderStore,
};
use serde_json::json;
use tokio::sync::{Barrier, mpsc};

pub const WEBHOOK_SECRET: &str = "whsec_test_9f8e7d6c5b4a";

/// Scripted stand-in for the processor. Repeated idempotency keys return the
/// original intent, as the real processor does.
#[derive(Default)]
pub struct FakeGateway {
    pub create_calls: AtomicUsize,
    pub retrieve_calls: AtomicUsize,
    failure: Mutex<Option<GatewayError>>,
    create_barrier: Mutex<Option<Arc<Barrier>>>,
    intents: Mutex<HashMap<String, PaymentIntent>>,
    by_key: Mutex<HashMap<String, String>>,
}

impl FakeGateway {
    pub fn fail_with(&self, error: GatewayError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    /// Makes the next `parties` creates wait for each other before answering,
    /// so concurrent callers all get past their local reads first.
    pub fn hold_creates(&self, parties: usize) {
        *self.create_barrier.lock().unwrap() = Some(Arc::new(Barrier::new(parties)));
    }

    pub fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn retrieves(&self) -> usize {
        self.retrieve_calls.load(Ordering::SeqCst)
    }

    /// Registers an intent as the processor would report it.
    pub fn put_intent(&self, id: &str, order_id: Option<i32>, status: IntentStatus) {
        let mut metadata = HashMap::new();
        if let Some(order_id) = order_id {
            metadata.insert(ORDER_ID_METADATA_KEY.to_string(), order_id.to_string());
        }
        self.intents.lock().unwrap().insert(
            id.to_string(),
            PaymentIntent {
                id: id.to_string(),
                client_secret: Some(format!("{}_secret", id)),
                amount: 5_000_000,
                currency: "cop".into(),
                status,
                metadata,
            },
        );
    }

    pub fn set_status(&self, id: &str, status: IntentStatus) {
        if let Some(intent) = self.intents.lock().unwrap().get_mut(id) {
            intent.status = status;
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn name(&self) -> &str {
        "stripe"
    }

    async fn create_intent(&self, request: CreateIntent) -> Result<PaymentIntent, GatewayError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let barrier = self.create_barrier.lock().unwrap().clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }

        let mut by_key = self.by_key.lock().unwrap();
        let mut intents = self.intents.lock().unwrap();
        if let Some(existing) = by_key.get(&request.idempotency_key) {
            return Ok(intents[existing].clone());
        }

        let id = format!("pi_fake_{}", intents.len() + 1);
        let mut metadata: HashMap<String, String> = request.metadata.into_iter().collect();
        metadata.insert(ORDER_ID_METADATA_KEY.into(), request.order_id.to_string());
        let intent = PaymentIntent {
            id: id.clone(),
            client_secret: Some(format!("{}_secret_abc", id)),
            amount: request.amount.minor(),
            currency: request.amount.currency().code().to_string(),
            status: IntentStatus::RequiresPaymentMethod,
            metadata,
        };
        intents.insert(id.clone(), intent.clone());
        by_key.insert(request.idempotency_key, id);
        Ok(intent)
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        self.intents
            .lock()
            .unwrap()
            .get(intent_id)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected {
                code: "resource_missing".into(),
                message: format!("No such payment_intent: '{}'", intent_id),
            })
    }
}

/// Forwards delivered notifications to the test.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        self.tx.send(notification.clone())?;
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<MemoryOrderStore>,
    pub gateway: Arc<FakeGateway>,
    pub audit: Arc<MemoryAuditSink>,
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub confirmations: Arc<ConfirmationHandler>,
    pub webhooks: Arc<WebhookReceiver>,
    delivered: mpsc::UnboundedReceiver<Notification>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryOrderStore::new());
        let gateway = Arc::new(FakeGateway::default());
        let audit = Arc::new(MemoryAuditSink::new());
        let recorder = AuditRecorder::new(audit.clone());
        let currency = Currency::new("cop").unwrap();

        let (tx, delivered) = mpsc::unbounded_channel();
        let (notifications, _worker) = NotificationDispatcher::spawn(
            Arc::new(ChannelSink { tx }),
            RetryPolicy {
                max_retries: 0,
                ..RetryPolicy::default()
            },
        );

        let orchestrator = PaymentOrchestrator::new(store.clone(), recorder.clone(), currency.clone())
            .with_gateway(gateway.clone());
        let confirmations = Arc::new(ConfirmationHandler::new(
            store.clone(),
            gateway.clone(),
            recorder,
            notifications,
            currency,
        ));
        let webhooks = Arc::new(WebhookReceiver::new(
            WEBHOOK_SECRET.to_string(),
            Duration::from_secs(300),
            confirmations.clone(),
        ));

        Self {
            store,
            gateway,
            audit,
            orchestrator: Arc::new(orchestrator),
            confirmations,
            webhooks,
            delivered,
        }
    }

    pub fn app(&self) -> Router {
        routes::app(AppState {
            orchestrator: self.orchestrator.clone(),
            confirmations: self.confirmations.clone(),
            webhooks: self.webhooks.clone(),
        })
    }

    /// Seeds order #42: consumer 7, producer 9, total 50000 COP, 3 items.
    pub async fn seed_order_42(&self) {
        self.store.insert_order(42, 7, 9, 5_000_000, &[2, 1]).await;
    }

    /// Waits for `expected` notifications, then checks nothing else arrives.
    pub async fn notifications(&mut self, expected: usize) -> Vec<Notification> {
        let mut received = Vec::new();
        while received.len() < expected {
            match tokio::time::timeout(Duration::from_secs(2), self.delivered.recv()).await {
                Ok(Some(notification)) => received.push(notification),
                _ => break,
            }
        }
        if let Ok(Some(extra)) =
            tokio::time::timeout(Duration::from_millis(100), self.delivered.recv()).await
        {
            received.push(extra);
        }
        received
    }
}

pub fn intent_event(event_id: &str, event_type: &str, intent_id: &str, order_id: Option<i32>) -> Vec<u8> {
    let metadata = match order_id {
        Some(order_id) => json!({ "order_id": order_id.to_string() }),
        None => json!({}),
    };
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": event_type,
        "data": {
            "object": {
                "id": intent_id,
                "object": "payment_intent",
                "status": "succeeded",
                "metadata": metadata,
            }
        }
    }))
    .unwrap()
}

pub fn sign(payload: &[u8]) -> String {
    sign_with(payload, WEBHOOK_SECRET, Utc::now().timestamp())
}

pub fn sign_with(payload: &[u8], secret: &str, timestamp: i64) -> String {
    format!(
        "t={},v1={}",
        timestamp,
        compute_signature(payload, secret, timestamp).unwrap()
    )
}
