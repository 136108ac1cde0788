use evisit_billing::gateway::SubscriptionSnapshot;
use evisit_billing::testing::{sample_user, FakeGateway};
use evisit_billing::{BillingError, BillingStore, DeliveryJob, FulfillmentOutcome, Purchase, WebhookOutcome};
use evisit_shared::{LicenseStatus, PlanType};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::support::{billing, event, sign};

fn yearly_subscription(id: &str, user_id: Uuid) -> SubscriptionSnapshot {
    SubscriptionSnapshot {
        id: id.into(),
        customer_id: "cus_flow".into(),
        current_period_end: OffsetDateTime::from_unix_timestamp(1_800_000_000).ok(),
        price_id: Some("price_yearly".into()),
        metadata: Purchase::License {
            user_id: Some(user_id),
            plan: Some(PlanType::Yearly),
            bonus_coins: 25,
        }
        .to_metadata(),
    }
}

fn checkout_completed(event_id: &str, subscription_id: &str) -> Vec<u8> {
    event(
        event_id,
        "checkout.session.completed",
        json!({
            "id": "cs_flow",
            "mode": "subscription",
            "subscription": subscription_id,
            "amount_total": 4999,
            "currency": "eur",
            "metadata": {}
        }),
    )
}

// ============================================================================
// Initial subscription
// ============================================================================

#[tokio::test]
async fn test_replayed_subscription_checkout_creates_one_license() {
    // Given: a yearly subscription carrying a 25 coin bonus
    let user = sample_user();
    let gateway = FakeGateway::new().with_subscription(yearly_subscription("sub_flow", user.id));
    let mut t = billing(gateway);
    t.store.insert_user(user.clone());

    // When: Stripe delivers the same completion twice, then again under a new event id
    let payload = checkout_completed("evt_checkout", "sub_flow");
    let first = t.billing.webhooks.handle(&payload, Some(&sign(&payload))).await.unwrap();
    let replay = t.billing.webhooks.handle(&payload, Some(&sign(&payload))).await.unwrap();
    let other = checkout_completed("evt_checkout_again", "sub_flow");
    let redelivered = t.billing.webhooks.handle(&other, Some(&sign(&other))).await.unwrap();

    // Then: one license, one bonus credit, one receipt
    assert!(matches!(
        first,
        WebhookOutcome::Processed {
            outcome: FulfillmentOutcome::LicenseActivated { .. },
            ..
        }
    ));
    assert!(matches!(replay, WebhookOutcome::Duplicate { .. }));
    assert!(matches!(
        redelivered,
        WebhookOutcome::Processed {
            outcome: FulfillmentOutcome::AlreadyFulfilled { .. },
            ..
        }
    ));

    let licenses = t.store.licenses_for(user.id);
    assert_eq!(licenses.len(), 1);
    assert_eq!(licenses[0].plan_type, PlanType::Yearly);
    assert_eq!(licenses[0].subscription_status, LicenseStatus::Active);

    let stored = t.store.user(user.id).unwrap();
    assert_eq!(stored.coin_balance, 25);
    assert_eq!(stored.stripe_customer_id.as_deref(), Some("cus_flow"));
    assert_eq!(t.store.receipts_for(user.id).len(), 1);

    let job = t.jobs.try_recv().unwrap();
    assert!(matches!(job, DeliveryJob::Receipt { .. }));
    assert!(t.jobs.try_recv().is_err());
}

#[tokio::test]
async fn test_receipt_delivery_after_webhook() {
    let user = sample_user();
    let gateway = FakeGateway::new().with_subscription(yearly_subscription("sub_mail", user.id));
    let mut t = billing(gateway);
    t.store.insert_user(user.clone());

    let payload = checkout_completed("evt_mail", "sub_mail");
    t.billing.webhooks.handle(&payload, Some(&sign(&payload))).await.unwrap();

    let worker = t.billing.delivery_worker();
    worker.process(t.jobs.try_recv().unwrap()).await;

    let sent = t.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, user.email);
    let receipt = &t.store.receipts_for(user.id)[0];
    assert!(receipt.delivered_at.is_some());
}

// ============================================================================
// Coins
// ============================================================================

#[tokio::test]
async fn test_coin_payment_credited_once_across_event_ids() {
    let t = billing(FakeGateway::new());
    let user = t.store.insert_user(sample_user());

    let intent = json!({
        "id": "pi_coins",
        "amount": 999,
        "amount_received": 999,
        "currency": "eur",
        "metadata": {"purchase_type": "ev_coins", "userId": user.id.to_string(), "coins_to_add": "100"}
    });

    for event_id in ["evt_a", "evt_b"] {
        let payload = event(event_id, "payment_intent.succeeded", intent.clone());
        t.billing.webhooks.handle(&payload, Some(&sign(&payload))).await.unwrap();
    }

    assert_eq!(t.store.user(user.id).unwrap().coin_balance, 100);
    let receipts = t.store.receipts_for(user.id);
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].item_description, "100 E-Tokens Package");
}

#[tokio::test]
async fn test_bad_signature_changes_nothing() {
    let t = billing(FakeGateway::new());
    let user = t.store.insert_user(sample_user());

    let payload = event(
        "evt_forged",
        "payment_intent.succeeded",
        json!({
            "id": "pi_forged",
            "amount": 999,
            "currency": "eur",
            "metadata": {"purchase_type": "ev_coins", "userId": user.id.to_string(), "coins_to_add": "1000"}
        }),
    );
    let forged = format!("t={},v1={}", OffsetDateTime::now_utc().unix_timestamp(), "ab".repeat(32));

    let err = t.billing.webhooks.handle(&payload, Some(&forged)).await.unwrap_err();
    assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    assert_eq!(t.store.user(user.id).unwrap().coin_balance, 0);
    assert_eq!(t.store.receipt_count(), 0);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_renewal_for_unknown_subscription_fails() {
    let t = billing(FakeGateway::new());
    let payload = event(
        "evt_renew",
        "invoice.paid",
        json!({
            "id": "in_renew",
            "billing_reason": "subscription_cycle",
            "subscription": "sub_missing",
            "amount_paid": 4999,
            "currency": "eur"
        }),
    );

    let err = t.billing.webhooks.handle(&payload, Some(&sign(&payload))).await.unwrap_err();
    assert!(matches!(err, BillingError::UnknownSubscription(ref id) if id == "sub_missing"));
}

#[tokio::test]
async fn test_cancellation_of_unknown_subscription_is_ok() {
    let t = billing(FakeGateway::new());
    let payload = event("evt_gone", "customer.subscription.deleted", json!({"id": "sub_gone"}));

    let outcome = t.billing.webhooks.handle(&payload, Some(&sign(&payload))).await.unwrap();
    assert!(matches!(
        outcome,
        WebhookOutcome::Processed {
            outcome: FulfillmentOutcome::Skipped { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn test_payment_failure_marks_license_past_due() {
    let user = sample_user();
    let gateway = FakeGateway::new().with_subscription(yearly_subscription("sub_late", user.id));
    let t = billing(gateway);
    t.store.insert_user(user.clone());

    let start = checkout_completed("evt_start", "sub_late");
    t.billing.webhooks.handle(&start, Some(&sign(&start))).await.unwrap();

    let failed = event(
        "evt_failed",
        "invoice.payment_failed",
        json!({"id": "in_failed", "customer": "cus_flow", "subscription": "sub_late"}),
    );
    let outcome = t.billing.webhooks.handle(&failed, Some(&sign(&failed))).await.unwrap();

    assert!(matches!(
        outcome,
        WebhookOutcome::Processed {
            outcome: FulfillmentOutcome::MarkedPastDue { .. },
            ..
        }
    ));
    let license = t.store.find_license_by_subscription("sub_late").await.unwrap().unwrap();
    assert_eq!(license.subscription_status, LicenseStatus::PastDue);
}

#[tokio::test]
async fn test_payment_failure_for_unknown_customer_is_skipped() {
    let t = billing(FakeGateway::new());
    let failed = event(
        "evt_failed",
        "invoice.payment_failed",
        json!({"id": "in_failed", "customer": "cus_nobody", "subscription": "sub_nobody"}),
    );

    let outcome = t.billing.webhooks.handle(&failed, Some(&sign(&failed))).await.unwrap();
    assert!(matches!(
        outcome,
        WebhookOutcome::Processed {
            outcome: FulfillmentOutcome::Skipped { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn test_renewal_takes_period_end_from_subscription() {
    let user = sample_user();
    let mut subscription = yearly_subscription("sub_cycle", user.id);
    subscription.current_period_end = OffsetDateTime::from_unix_timestamp(1_900_000_000).ok();
    let t = billing(FakeGateway::new().with_subscription(subscription));
    t.store.insert_user(user.clone());

    let start = checkout_completed("evt_start", "sub_cycle");
    t.billing.webhooks.handle(&start, Some(&sign(&start))).await.unwrap();

    let cycle = event(
        "evt_cycle",
        "invoice.paid",
        json!({
            "id": "in_cycle",
            "billing_reason": "subscription_cycle",
            "subscription": "sub_cycle",
            "amount_paid": 4999,
            "currency": "eur",
            "period_end": 1_700_000_000
        }),
    );
    let outcome = t.billing.webhooks.handle(&cycle, Some(&sign(&cycle))).await.unwrap();
    assert!(matches!(
        outcome,
        WebhookOutcome::Processed {
            outcome: FulfillmentOutcome::Renewed { .. },
            ..
        }
    ));

    let license = t.store.find_license_by_subscription("sub_cycle").await.unwrap().unwrap();
    assert_eq!(
        license.current_period_end.map(|t| t.unix_timestamp()),
        Some(1_900_000_000)
    );
    assert_eq!(t.store.receipts_for(user.id).len(), 2);
}
