use std::sync::Arc;
use std::time::Duration;

use evisit_billing::testing::{company, templates, FakeGateway, RecordingNotifier, StaticRenderer};
use evisit_billing::webhooks::compute_signature;
use evisit_billing::{
    BillingComponents, BillingService, DeliveryJob, InMemoryBillingStore, PlanPrice, StripeConfig,
};
use evisit_shared::PlanType;
use tokio::sync::mpsc;

pub const WEBHOOK_SECRET: &str = "whsec_integration";

pub struct TestBilling {
    pub store: Arc<InMemoryBillingStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub billing: BillingService,
    pub jobs: mpsc::Receiver<DeliveryJob>,
}

pub fn stripe_config() -> StripeConfig {
    StripeConfig {
        secret_key: "sk_test_integration".into(),
        webhook_secret: WEBHOOK_SECRET.into(),
        webhook_tolerance: Duration::from_secs(300),
        plans: vec![
            PlanPrice {
                price_id: "price_monthly".into(),
                plan: PlanType::Monthly,
                bonus_coins: 5,
            },
            PlanPrice {
                price_id: "price_yearly".into(),
                plan: PlanType::Yearly,
                bonus_coins: 25,
            },
        ],
        app_base_url: "http://localhost:3000".into(),
    }
}

pub fn billing(gateway: FakeGateway) -> TestBilling {
    let store = Arc::new(InMemoryBillingStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let (billing, jobs) = BillingService::new(BillingComponents {
        store: store.clone(),
        documents: store.clone(),
        gateway: Arc::new(gateway),
        renderer: Arc::new(StaticRenderer::ok()),
        notifier: notifier.clone(),
        templates: Arc::new(templates()),
        company: company(),
        config: stripe_config(),
        queue_capacity: 16,
    });
    TestBilling {
        store,
        notifier,
        billing,
        jobs,
    }
}

/// `Stripe-Signature` header for a payload signed now
pub fn sign(payload: &[u8]) -> String {
    let timestamp = time::OffsetDateTime::now_utc().unix_timestamp();
    format!(
        "t={},v1={}",
        timestamp,
        compute_signature(WEBHOOK_SECRET, timestamp, payload).unwrap()
    )
}

pub fn event(id: &str, event_type: &str, object: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "id": id,
        "type": event_type,
        "created": 1_760_000_000,
        "data": {"object": object}
    }))
    .unwrap()
}
