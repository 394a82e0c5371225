mod common;

use common::Harness;
use futures::future::join_all;
use marketplace_payments::{
    api::gateway::IntentStatus,
    app_error::AppError,
    domain::{AttemptStatus, PaymentMethod, PaymentStatus},
    models::CreatePaymentEntity,
    services::{
        confirmation::{ConfirmationResult, GatewayOutcome, OutcomeSource},
        notifications::NotificationKind,
        orchestrator::CreatePayment,
    },
    stores::OrderStore,
};
use rust_decimal_macros::dec;

/// Seeds order #42 and starts a card payment, returning the intent id.
async fn pending_card_payment(harness: &Harness) -> String {
    harness.seed_order_42().await;
    harness
        .orchestrator
        .create_payment(CreatePayment {
            order_id: 42,
            actor_id: Some(7),
            amount: dec!(50000),
            method: PaymentMethod::Card,
            gateway: None,
        })
        .await
        .unwrap()
        .payment_ref
        .unwrap()
}

fn webhook_outcome(intent_id: &str, status: AttemptStatus, order_hint: Option<i32>) -> GatewayOutcome {
    GatewayOutcome {
        intent_id: intent_id.to_string(),
        status,
        order_hint,
        source: OutcomeSource::Webhook {
            event_id: "evt_1".into(),
        },
        failure_reason: None,
    }
}

#[tokio::test]
async fn success_marks_the_order_paid_and_notifies_both_parties() {
    let mut harness = Harness::new();
    let intent_id = pending_card_payment(&harness).await;

    let result = harness
        .confirmations
        .apply(webhook_outcome(&intent_id, AttemptStatus::Succeeded, Some(42)))
        .await
        .unwrap();
    assert_eq!(result, ConfirmationResult::Paid { order_id: 42 });

    let order = harness.store.find_order(42).await.unwrap().unwrap();
    assert_eq!(order.payment_status, "paid");
    assert_eq!(order.fulfillment_status, "confirmed");
    assert_eq!(harness.store.attempts_for(42).await[0].status, "succeeded");

    let confirm = harness
        .audit
        .records()
        .await
        .into_iter()
        .find(|record| record.action == "confirm_payment")
        .expect("confirm_payment audit record");
    assert_eq!(confirm.actor_id, None);
    assert_eq!(confirm.before_snapshot.unwrap()["payment_status"], "pending");
    assert_eq!(confirm.after_snapshot.unwrap()["payment_status"], "paid");

    let notifications = harness.notifications(2).await;
    assert_eq!(notifications.len(), 2);
    let consumer = notifications
        .iter()
        .find(|n| n.kind == NotificationKind::PaymentConfirmed)
        .unwrap();
    assert_eq!(consumer.user_id, 7);
    assert_eq!(consumer.title, "Pago confirmado");
    let producer = notifications
        .iter()
        .find(|n| n.kind == NotificationKind::NewOrder)
        .unwrap();
    assert_eq!(producer.user_id, 9);
    assert!(producer.message.starts_with("Nuevo pedido listo: 3 productos, total 50000"));
}

#[tokio::test]
async fn repeated_success_is_a_no_op() {
    let mut harness = Harness::new();
    let intent_id = pending_card_payment(&harness).await;

    harness
        .confirmations
        .apply(webhook_outcome(&intent_id, AttemptStatus::Succeeded, Some(42)))
        .await
        .unwrap();
    let writes_after_first = harness.store.write_count();
    let audits_after_first = harness.audit.records().await.len();

    let again = harness
        .confirmations
        .apply(webhook_outcome(&intent_id, AttemptStatus::Succeeded, Some(42)))
        .await
        .unwrap();

    assert_eq!(again, ConfirmationResult::Duplicate { order_id: 42 });
    assert_eq!(harness.store.write_count(), writes_after_first);
    assert_eq!(harness.audit.records().await.len(), audits_after_first);
    assert_eq!(harness.notifications(2).await.len(), 2);
}

#[tokio::test]
async fn concurrent_duplicates_transition_once() {
    let mut harness = Harness::new();
    let intent_id = pending_card_payment(&harness).await;

    let deliveries = (0..8).map(|_| {
        harness
            .confirmations
            .apply(webhook_outcome(&intent_id, AttemptStatus::Succeeded, Some(42)))
    });
    let results = join_all(deliveries).await;

    let paid = results
        .iter()
        .filter(|result| matches!(result, Ok(ConfirmationResult::Paid { .. })))
        .count();
    let duplicates = results
        .iter()
        .filter(|result| matches!(result, Ok(ConfirmationResult::Duplicate { .. })))
        .count();
    assert_eq!(paid, 1);
    assert_eq!(duplicates, 7);

    let confirmations = harness
        .audit
        .records()
        .await
        .into_iter()
        .filter(|record| record.action == "confirm_payment")
        .count();
    assert_eq!(confirmations, 1);
    assert_eq!(harness.notifications(2).await.len(), 2);
}

#[tokio::test]
async fn failed_payment_closes_the_attempt_but_keeps_the_order_pending() {
    let mut harness = Harness::new();
    let intent_id = pending_card_payment(&harness).await;

    let result = harness
        .confirmations
        .apply(GatewayOutcome {
            failure_reason: Some("card_declined: Your card was declined.".into()),
            ..webhook_outcome(&intent_id, AttemptStatus::Failed, Some(42))
        })
        .await
        .unwrap();

    assert_eq!(
        result,
        ConfirmationResult::AttemptClosed {
            order_id: 42,
            status: AttemptStatus::Failed
        }
    );
    let order = harness.store.find_order(42).await.unwrap().unwrap();
    assert_eq!(order.payment_status, "pending");
    let attempt = &harness.store.attempts_for(42).await[0];
    assert_eq!(attempt.status, "failed");
    assert_eq!(
        attempt.failure_reason.as_deref(),
        Some("card_declined: Your card was declined.")
    );
    assert!(
        harness
            .audit
            .records()
            .await
            .iter()
            .any(|record| record.action == "payment_attempt_failed" && record.table_name == "payments")
    );
    assert!(harness.notifications(0).await.is_empty());
}

#[tokio::test]
async fn late_failure_never_regresses_a_paid_order() {
    let harness = Harness::new();
    let intent_id = pending_card_payment(&harness).await;

    harness
        .confirmations
        .apply(webhook_outcome(&intent_id, AttemptStatus::Succeeded, Some(42)))
        .await
        .unwrap();
    let writes = harness.store.write_count();

    let result = harness
        .confirmations
        .apply(webhook_outcome(&intent_id, AttemptStatus::Failed, Some(42)))
        .await
        .unwrap();

    assert_eq!(result, ConfirmationResult::Duplicate { order_id: 42 });
    assert_eq!(harness.store.write_count(), writes);
    let order = harness.store.find_order(42).await.unwrap().unwrap();
    assert_eq!(order.payment_status().unwrap(), PaymentStatus::Paid);
}

#[tokio::test]
async fn order_is_recovered_from_the_processor_when_metadata_is_missing() {
    let harness = Harness::new();
    let intent_id = pending_card_payment(&harness).await;
    let retrieves = harness.gateway.retrieves();

    // Local attempt is enough; no lookup needed.
    let result = harness
        .confirmations
        .apply(webhook_outcome(&intent_id, AttemptStatus::Succeeded, None))
        .await
        .unwrap();
    assert_eq!(result, ConfirmationResult::Paid { order_id: 42 });
    assert_eq!(harness.gateway.retrieves(), retrieves);

    // Unknown locally: one lookup at the processor.
    harness.store.insert_order(43, 7, 9, 1_000, &[1]).await;
    harness
        .gateway
        .put_intent("pi_external", Some(43), IntentStatus::Succeeded);
    let result = harness
        .confirmations
        .apply(webhook_outcome("pi_external", AttemptStatus::Succeeded, None))
        .await
        .unwrap();
    assert_eq!(result, ConfirmationResult::Paid { order_id: 43 });
    assert_eq!(harness.gateway.retrieves(), retrieves + 1);
}

#[tokio::test]
async fn unresolvable_events_are_acknowledged_without_writes() {
    let harness = Harness::new();
    harness.seed_order_42().await;
    let writes = harness.store.write_count();

    let result = harness
        .confirmations
        .apply(webhook_outcome("pi_unknown", AttemptStatus::Succeeded, None))
        .await
        .unwrap();

    assert_eq!(
        result,
        ConfirmationResult::Unresolved {
            intent_id: "pi_unknown".into()
        }
    );
    assert_eq!(harness.gateway.retrieves(), 1);
    assert_eq!(harness.store.write_count(), writes);
    assert!(harness.audit.records().await.is_empty());
}

#[tokio::test]
async fn intent_recorded_for_another_order_is_never_guessed() {
    let harness = Harness::new();
    let intent_id = pending_card_payment(&harness).await;
    harness.store.insert_order(43, 7, 9, 5_000_000, &[1]).await;
    let writes = harness.store.write_count();

    let result = harness
        .confirmations
        .apply(webhook_outcome(&intent_id, AttemptStatus::Succeeded, Some(43)))
        .await
        .unwrap();

    assert!(matches!(result, ConfirmationResult::Unresolved { .. }));
    assert_eq!(harness.store.write_count(), writes);
}

#[tokio::test]
async fn client_confirm_ignores_a_forged_success() {
    let harness = Harness::new();
    let intent_id = pending_card_payment(&harness).await;
    let writes = harness.store.write_count();

    let result = harness
        .confirmations
        .confirm_from_client(&intent_id, 42, Some("succeeded"), Some(7))
        .await
        .unwrap();

    assert_eq!(result, ConfirmationResult::Pending { order_id: 42 });
    assert_eq!(harness.store.write_count(), writes);
    let order = harness.store.find_order(42).await.unwrap().unwrap();
    assert_eq!(order.payment_status, "pending");
}

#[tokio::test]
async fn client_confirm_applies_the_processor_state() {
    let mut harness = Harness::new();
    let intent_id = pending_card_payment(&harness).await;
    harness.gateway.set_status(&intent_id, IntentStatus::Succeeded);

    let result = harness
        .confirmations
        .confirm_from_client(&intent_id, 42, None, Some(7))
        .await
        .unwrap();

    assert_eq!(result, ConfirmationResult::Paid { order_id: 42 });
    let confirm = harness
        .audit
        .records()
        .await
        .into_iter()
        .find(|record| record.action == "confirm_payment")
        .unwrap();
    assert_eq!(confirm.actor_id, Some(7));
    assert_eq!(harness.notifications(2).await.len(), 2);
}

#[tokio::test]
async fn client_confirm_rejects_an_intent_of_another_order() {
    let harness = Harness::new();
    let intent_id = pending_card_payment(&harness).await;
    harness.gateway.set_status(&intent_id, IntentStatus::Succeeded);

    let err = harness
        .confirmations
        .confirm_from_client(&intent_id, 99, Some("succeeded"), Some(7))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Validation(_)));
    let order = harness.store.find_order(42).await.unwrap().unwrap();
    assert_eq!(order.payment_status, "pending");
}

#[tokio::test]
async fn store_outage_propagates_as_unavailable() {
    let harness = Harness::new();
    let intent_id = pending_card_payment(&harness).await;
    harness.store.set_unavailable(true);

    let err = harness
        .confirmations
        .apply(webhook_outcome(&intent_id, AttemptStatus::Succeeded, Some(42)))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::ServiceUnavailable(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn repeated_checkout_then_success_charges_once() {
    let mut harness = Harness::new();
    let first = pending_card_payment(&harness).await;
    let second = harness
        .orchestrator
        .create_payment(CreatePayment {
            order_id: 42,
            actor_id: Some(7),
            amount: dec!(50000),
            method: PaymentMethod::Card,
            gateway: None,
        })
        .await
        .unwrap()
        .payment_ref
        .unwrap();
    assert_eq!(second, first);
    assert_eq!(harness.gateway.creates(), 1);

    let results = [
        harness
            .confirmations
            .apply(webhook_outcome(&first, AttemptStatus::Succeeded, Some(42)))
            .await
            .unwrap(),
        harness
            .confirmations
            .apply(webhook_outcome(&second, AttemptStatus::Succeeded, Some(42)))
            .await
            .unwrap(),
    ];

    assert_eq!(results[0], ConfirmationResult::Paid { order_id: 42 });
    assert_eq!(results[1], ConfirmationResult::Duplicate { order_id: 42 });
    assert_eq!(harness.notifications(2).await.len(), 2);
}

#[tokio::test]
async fn success_on_a_second_intent_is_flagged_as_a_duplicate_charge() {
    let mut harness = Harness::new();
    let paying = pending_card_payment(&harness).await;
    // A second attempt that slipped through before the order was paid.
    harness
        .store
        .record_attempt(
            CreatePaymentEntity {
                order_id: 42,
                provider: "stripe".into(),
                provider_ref: "pi_second".into(),
                amount_minor: 5_000_000,
                currency: "cop".into(),
                status: AttemptStatus::Created.as_str().into(),
                idempotency_key: "order-42-attempt-2".into(),
            },
            PaymentMethod::Card,
        )
        .await
        .unwrap();

    harness
        .confirmations
        .apply(webhook_outcome(&paying, AttemptStatus::Succeeded, Some(42)))
        .await
        .unwrap();
    let paid = harness.store.find_order(42).await.unwrap().unwrap();
    assert_eq!(paid.paid_provider_ref.as_deref(), Some(paying.as_str()));

    let result = harness
        .confirmations
        .apply(webhook_outcome("pi_second", AttemptStatus::Succeeded, Some(42)))
        .await
        .unwrap();

    assert_eq!(result, ConfirmationResult::DuplicateCharge { order_id: 42 });
    let order = harness.store.find_order(42).await.unwrap().unwrap();
    assert_eq!(order.paid_provider_ref.as_deref(), Some(paying.as_str()));
    assert_eq!(order.updated_at, paid.updated_at);

    let second = harness.store.find_attempt("pi_second").await.unwrap().unwrap();
    assert_eq!(second.status().unwrap(), AttemptStatus::Succeeded);

    let flagged = harness
        .audit
        .records()
        .await
        .into_iter()
        .find(|record| record.action == "duplicate_charge")
        .expect("duplicate_charge audit record");
    assert_eq!(flagged.table_name, "payments");
    assert_eq!(flagged.entity_id, "pi_second");
    assert_eq!(flagged.outcome, "failure");
    assert!(flagged.description.unwrap().contains(&paying));

    // Still only the notifications of the first payment.
    assert_eq!(harness.notifications(2).await.len(), 2);

    // Redelivery of the paying intent stays a plain duplicate.
    let again = harness
        .confirmations
        .apply(webhook_outcome(&paying, AttemptStatus::Succeeded, Some(42)))
        .await
        .unwrap();
    assert_eq!(again, ConfirmationResult::Duplicate { order_id: 42 });
}

#[tokio::test]
async fn success_after_a_failed_attempt_pays_and_notes_the_mismatch() {
    let harness = Harness::new();
    let intent_id = pending_card_payment(&harness).await;

    harness
        .confirmations
        .apply(webhook_outcome(&intent_id, AttemptStatus::Failed, Some(42)))
        .await
        .unwrap();
    let result = harness
        .confirmations
        .apply(webhook_outcome(&intent_id, AttemptStatus::Succeeded, Some(42)))
        .await
        .unwrap();

    assert_eq!(result, ConfirmationResult::Paid { order_id: 42 });
    let order = harness.store.find_order(42).await.unwrap().unwrap();
    assert_eq!(order.payment_status().unwrap(), PaymentStatus::Paid);
    assert_eq!(harness.store.attempts_for(42).await[0].status, "failed");

    let confirm = harness
        .audit
        .records()
        .await
        .into_iter()
        .find(|record| record.action == "confirm_payment")
        .unwrap();
    assert!(
        confirm
            .description
            .unwrap()
            .ends_with("local attempt was failed")
    );
}

#[tokio::test]
async fn client_confirm_rejects_ids_that_are_not_intents() {
    let harness = Harness::new();
    pending_card_payment(&harness).await;
    let retrieves = harness.gateway.retrieves();

    for intent_id in ["x/../../v1/customers", "cus_123", "pi_1?expand[]=customer"] {
        let err = harness
            .confirmations
            .confirm_from_client(intent_id, 42, None, Some(7))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)), "{intent_id}");
    }
    assert_eq!(harness.gateway.retrieves(), retrieves);
}
