use std::sync::Arc;

use crate::services::{
    confirmation::ConfirmationHandler, orchestrator::PaymentOrchestrator, webhook::WebhookReceiver,
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub confirmations: Arc<ConfirmationHandler>,
    pub webhooks: Arc<WebhookReceiver>,
}
