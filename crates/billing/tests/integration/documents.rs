use chrono::{Datelike, NaiveDate, Utc};
use evisit_billing::testing::{admin_user, FakeGateway};
use evisit_billing::{BillingError, DocumentInput, DocumentKind, LineItemInput};
use evisit_shared::DocumentStatus;
use rust_decimal_macros::dec;

use crate::support::billing;

fn input(recipient: &str) -> DocumentInput {
    DocumentInput {
        recipient_name: recipient.into(),
        recipient_email: "billing@client.test".into(),
        due_date: NaiveDate::from_ymd_opt(2026, 12, 31),
        tax: Some(dec!(10)),
        notes: None,
        line_items: vec![
            LineItemInput {
                description: "Listing setup".into(),
                quantity: dec!(1),
                unit_price: dec!(150),
            },
            LineItemInput {
                description: "Featured placement (weeks)".into(),
                quantity: dec!(4),
                unit_price: dec!(12.50),
            },
        ],
    }
}

#[tokio::test]
async fn test_consecutive_invoices_get_consecutive_numbers() {
    let t = billing(FakeGateway::new());
    let admin = admin_user();
    let year = Utc::now().year();

    let first = t
        .billing
        .documents
        .create(DocumentKind::Invoice, input("Hotel Arbëria"), admin.id)
        .await
        .unwrap();
    let second = t
        .billing
        .documents
        .create(DocumentKind::Invoice, input("Kafe Prishtina"), admin.id)
        .await
        .unwrap();

    assert_eq!(first.number, format!("INV-{}-0001", year));
    assert_eq!(second.number, format!("INV-{}-0002", year));
    assert_eq!(first.subtotal, dec!(200));
    assert_eq!(first.total_amount, dec!(210));
}

#[tokio::test]
async fn test_invoice_and_offer_sequences_are_independent() {
    let t = billing(FakeGateway::new());
    let admin = admin_user();
    let year = Utc::now().year();

    t.billing
        .documents
        .create(DocumentKind::Invoice, input("A"), admin.id)
        .await
        .unwrap();
    let offer = t
        .billing
        .documents
        .create(DocumentKind::Offer, input("B"), admin.id)
        .await
        .unwrap();

    assert_eq!(offer.number, format!("OFFER-{}-0001", year));
}

#[tokio::test]
async fn test_missing_sequence_is_fatal() {
    let t = billing(FakeGateway::new());
    t.store.drop_sequence("invoice");

    let err = t
        .billing
        .documents
        .create(DocumentKind::Invoice, input("A"), admin_user().id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::SequenceNotFound(ref name) if name == "invoice"));
    assert!(t
        .billing
        .documents
        .list(DocumentKind::Invoice)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_send_then_pay() {
    let t = billing(FakeGateway::new());
    let invoice = t
        .billing
        .documents
        .create(DocumentKind::Invoice, input("Hotel Arbëria"), admin_user().id)
        .await
        .unwrap();

    let sent = t
        .billing
        .documents
        .send(DocumentKind::Invoice, invoice.id)
        .await
        .unwrap();
    assert_eq!(sent.status, DocumentStatus::Sent);

    let emails = t.notifier.sent();
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].to, "billing@client.test");
    assert!(emails[0].subject.contains(&invoice.number));

    let paid = t
        .billing
        .documents
        .update_status(DocumentKind::Invoice, invoice.id, DocumentStatus::Paid)
        .await
        .unwrap();
    assert_eq!(paid.status, DocumentStatus::Paid);
}

#[tokio::test]
async fn test_sending_twice_emails_once() {
    let t = billing(FakeGateway::new());
    let offer = t
        .billing
        .documents
        .create(DocumentKind::Offer, input("Kafe Prishtina"), admin_user().id)
        .await
        .unwrap();

    t.billing.documents.send(DocumentKind::Offer, offer.id).await.unwrap();
    let err = t
        .billing
        .documents
        .send(DocumentKind::Offer, offer.id)
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::InvalidState(_)));
    assert_eq!(t.notifier.sent().len(), 1);
}

#[tokio::test]
async fn test_offer_cannot_be_marked_paid() {
    let t = billing(FakeGateway::new());
    let offer = t
        .billing
        .documents
        .create(DocumentKind::Offer, input("A"), admin_user().id)
        .await
        .unwrap();
    t.billing.documents.send(DocumentKind::Offer, offer.id).await.unwrap();

    let err = t
        .billing
        .documents
        .update_status(DocumentKind::Offer, offer.id, DocumentStatus::Paid)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_) | BillingError::InvalidState(_)));

    let accepted = t
        .billing
        .documents
        .update_status(DocumentKind::Offer, offer.id, DocumentStatus::Accepted)
        .await
        .unwrap();
    assert_eq!(accepted.status, DocumentStatus::Accepted);
}

#[tokio::test]
async fn test_update_replaces_items_and_recomputes_totals() {
    let t = billing(FakeGateway::new());
    let created = t
        .billing
        .documents
        .create(DocumentKind::Invoice, input("Hotel Arbëria"), admin_user().id)
        .await
        .unwrap();

    let mut revised = input("Hotel Arbëria sh.p.k.");
    revised.tax = Some(dec!(0));
    revised.notes = Some("Revised after call".into());
    revised.line_items = vec![LineItemInput {
        description: "Annual listing".into(),
        quantity: dec!(2),
        unit_price: dec!(99.99),
    }];

    let updated = t
        .billing
        .documents
        .update(DocumentKind::Invoice, created.id, revised)
        .await
        .unwrap();

    assert_eq!(updated.number, created.number);
    assert_eq!(updated.issue_date, created.issue_date);
    assert_eq!(updated.status, DocumentStatus::Draft);
    assert_eq!(updated.recipient_name, "Hotel Arbëria sh.p.k.");
    assert_eq!(updated.line_items.len(), 1);
    assert_eq!(updated.line_items[0].description, "Annual listing");
    assert_eq!(updated.subtotal, dec!(199.98));
    assert_eq!(updated.total_amount, dec!(199.98));

    let stored = t
        .billing
        .documents
        .get(DocumentKind::Invoice, created.id)
        .await
        .unwrap();
    assert_eq!(stored.line_items, updated.line_items);
    assert_eq!(stored.notes.as_deref(), Some("Revised after call"));
}

#[tokio::test]
async fn test_update_unknown_document_is_not_found() {
    let t = billing(FakeGateway::new());

    let err = t
        .billing
        .documents
        .update(DocumentKind::Offer, uuid::Uuid::new_v4(), input("A"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound(_)));

    // Missing id wins over a bad payload
    let mut invalid = input("");
    invalid.line_items.clear();
    let err = t
        .billing
        .documents
        .update(DocumentKind::Offer, uuid::Uuid::new_v4(), invalid)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound(_)));
}

#[tokio::test]
async fn test_update_is_scoped_to_kind() {
    let t = billing(FakeGateway::new());
    let offer = t
        .billing
        .documents
        .create(DocumentKind::Offer, input("A"), admin_user().id)
        .await
        .unwrap();

    let err = t
        .billing
        .documents
        .update(DocumentKind::Invoice, offer.id, input("B"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_get_distinct_increasing_numbers() {
    let t = billing(FakeGateway::new());
    let admin = admin_user();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let service = t.billing.documents.clone();
            let admin_id = admin.id;
            tokio::spawn(async move {
                service
                    .create(DocumentKind::Invoice, input(&format!("Client {}", i)), admin_id)
                    .await
            })
        })
        .collect();

    let mut numbers = Vec::new();
    for handle in handles {
        numbers.push(handle.await.unwrap().unwrap().number);
    }
    numbers.sort();
    numbers.dedup();
    assert_eq!(numbers.len(), 16);

    let year = Utc::now().year();
    let expected: Vec<String> = (1..=16).map(|n| format!("INV-{}-{:04}", year, n)).collect();
    assert_eq!(numbers, expected);
}

// ============================================================================
// Postgres
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_postgres_invoice_numbers_are_unique_under_concurrency() {
    use std::sync::Arc;

    use evisit_billing::testing::{company, templates, RecordingNotifier, StaticRenderer};
    use evisit_billing::{DocumentService, PgDocumentRepository};

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let pool = evisit_shared::create_pool(&database_url, 10)
        .await
        .expect("Failed to connect to test database");
    evisit_shared::run_migrations(&pool).await.expect("Failed to run migrations");

    let admin_id: uuid::Uuid = sqlx::query_scalar(
        "INSERT INTO users (name, surname, email, role) VALUES ('Admin', '', $1, 'admin') RETURNING id",
    )
    .bind(format!("admin+{}@example.com", uuid::Uuid::new_v4().simple()))
    .fetch_one(&pool)
    .await
    .unwrap();

    let service = DocumentService::new(
        Arc::new(PgDocumentRepository::new(pool.clone())),
        Arc::new(StaticRenderer::ok()),
        Arc::new(RecordingNotifier::new()),
        Arc::new(templates()),
        company(),
    );

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .create(DocumentKind::Invoice, input(&format!("Client {}", i)), admin_id)
                    .await
            })
        })
        .collect();

    let mut numbers = Vec::new();
    for handle in handles {
        numbers.push(handle.await.unwrap().unwrap().number);
    }
    numbers.sort();
    numbers.dedup();
    assert_eq!(numbers.len(), 8);
}
