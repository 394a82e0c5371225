use std::sync::Arc;

use anyhow::{Context, Result};
use diesel_migrations::{EmbeddedMigrations, embed_migrations};
use marketplace_payments::{
    api::{PaymentGateway, StripeGateway},
    app_state::AppState,
    bootstrap,
    config::AppConfig,
    db,
    routes,
    services::{
        audit::{AuditRecorder, PgAuditSink},
        confirmation::ConfirmationHandler,
        notifications::{
            AmqpNotificationSink, NotificationDispatcher, NotificationSink, PgNotificationSink,
            RetryPolicy,
        },
        orchestrator::PaymentOrchestrator,
        webhook::WebhookReceiver,
    },
    stores::{OrderStore, PgOrderStore},
};

/// Migrations embedded into the binary which helps with streamlining image building process
const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::init_tracing();
    bootstrap::init_env();

    let config = AppConfig::load().context("Invalid configuration")?;
    tracing::info!(
        port = config.server.port,
        gateway = %config.gateway.name,
        currency = %config.gateway.currency,
        amqp = config.amqp.is_some(),
        "Configuration loaded"
    );

    tracing::info!("Running migrations...");
    let migrations_count = db::run_migrations_blocking(MIGRATIONS, &config.database.url).await?;
    tracing::info!("Run {} new migrations successfully", migrations_count);

    let pool = db::create_pool(&config.database.url).await?;
    let store: Arc<dyn OrderStore> = Arc::new(PgOrderStore::new(pool.clone()));
    let audit = AuditRecorder::new(Arc::new(PgAuditSink::new(pool.clone())));

    let notification_sink: Arc<dyn NotificationSink> = match &config.amqp {
        Some(amqp) => Arc::new(AmqpNotificationSink::connect(amqp).await?),
        None => Arc::new(PgNotificationSink::new(pool.clone())),
    };
    let (notifications, _notification_worker) =
        NotificationDispatcher::spawn(notification_sink, RetryPolicy::default());

    let gateway: Arc<dyn PaymentGateway> = Arc::new(
        StripeGateway::new(&config.gateway).context("Failed to initialise the payment gateway")?,
    );
    let currency = config.gateway.currency.clone();

    let orchestrator = PaymentOrchestrator::new(store.clone(), audit.clone(), currency.clone())
        .with_gateway(gateway.clone());
    let confirmations = Arc::new(ConfirmationHandler::new(
        store,
        gateway,
        audit,
        notifications,
        currency,
    ));
    let webhooks = WebhookReceiver::new(
        config.gateway.webhook_secret.clone(),
        config.gateway.webhook_tolerance,
        confirmations.clone(),
    );

    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        confirmations,
        webhooks: Arc::new(webhooks),
    };

    tracing::info!("Bootstrapping...");
    bootstrap::serve("PaymentService", routes::app(state), config.server.port).await
}
