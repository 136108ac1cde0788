//! Postgres backend

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use evisit_shared::{DocumentStatus, License, LicenseStatus, User};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    license_bonus_reference, BillingStore, EventClaim, LicenseActivation, NewLicense, NewReceipt,
    Receipt, RecordedReceipt,
};
use crate::documents::{
    Document, DocumentKind, DocumentRepository, DocumentSummary, LineItem, ValidatedDocument,
};
use crate::error::{BillingError, BillingResult};
use crate::receipts::RECEIPT_PREFIX;
use crate::sequence::{allocate, allocate_yearly, format_document_number, RECEIPT_SEQUENCE_FAMILY};

const USER_COLUMNS: &str =
    "id, name, surname, email, role, is_verified, coin_balance, stripe_customer_id, created_at";

const LICENSE_COLUMNS: &str = "id, user_id, stripe_subscription_id, plan_type, subscription_status, \
     current_period_end, stripe_session_id, created_at, updated_at";

const RECEIPT_COLUMNS: &str = "id, receipt_number, user_id, stripe_payment_intent_id, item_description, \
     amount, currency, issue_date, delivered_at, delivery_attempts, last_delivery_error, created_at";

/// Claims older than this in `processing` are considered abandoned
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn find_user(&self, user_id: Uuid) -> BillingResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE stripe_customer_id = $1",
            USER_COLUMNS
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn attach_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET stripe_customer_id = COALESCE(stripe_customer_id, $2), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    async fn credit_coins(&self, user_id: Uuid, coins: i64, payment_reference: &str) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO coin_credits (user_id, payment_reference, coins)
            SELECT id, $2, $3 FROM users WHERE id = $1
            ON CONFLICT (payment_reference) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(payment_reference)
        .bind(coins)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            let known: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
            if known.is_none() {
                return Err(BillingError::NotFound(format!("user {}", user_id)));
            }
            tracing::info!(
                user_id = %user_id,
                payment_reference = %payment_reference,
                "Coins already credited for payment"
            );
            return Ok(false);
        }

        sqlx::query("UPDATE users SET coin_balance = coin_balance + $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(coins)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn find_license_by_subscription(&self, subscription_id: &str) -> BillingResult<Option<License>> {
        let license = sqlx::query_as::<_, License>(&format!(
            "SELECT {} FROM licenses WHERE stripe_subscription_id = $1",
            LICENSE_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(license)
    }

    async fn latest_active_license(&self, user_id: Uuid) -> BillingResult<Option<License>> {
        let license = sqlx::query_as::<_, License>(&format!(
            r#"
            SELECT {} FROM licenses
            WHERE user_id = $1 AND subscription_status = 'active'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            LICENSE_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(license)
    }

    async fn activate_license(&self, new: NewLicense) -> BillingResult<LicenseActivation> {
        let mut tx = self.pool.begin().await?;

        // Serializes activations for the same user
        let locked: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(new.user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(BillingError::NotFound(format!("user {}", new.user_id)));
        }

        let inserted = sqlx::query_as::<_, License>(&format!(
            r#"
            INSERT INTO licenses
                (user_id, stripe_subscription_id, plan_type, subscription_status, current_period_end, stripe_session_id)
            VALUES ($1, $2, $3, 'active', $4, $5)
            ON CONFLICT (stripe_subscription_id) DO NOTHING
            RETURNING {}
            "#,
            LICENSE_COLUMNS
        ))
        .bind(new.user_id)
        .bind(&new.stripe_subscription_id)
        .bind(new.plan)
        .bind(new.current_period_end)
        .bind(&new.stripe_session_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(license) = inserted else {
            drop(tx);
            let sub = new.stripe_subscription_id.as_deref().unwrap_or_default();
            let existing = self
                .find_license_by_subscription(sub)
                .await?
                .ok_or_else(|| BillingError::Internal(format!("license for {} vanished", sub)))?;
            return Ok(LicenseActivation::AlreadyExists(existing));
        };

        let superseded = sqlx::query(
            r#"
            UPDATE licenses
            SET subscription_status = 'canceled', updated_at = NOW()
            WHERE user_id = $1 AND id <> $2 AND subscription_status = 'active'
            "#,
        )
        .bind(new.user_id)
        .bind(license.id)
        .execute(&mut *tx)
        .await?;

        if superseded.rows_affected() > 0 {
            tracing::info!(
                user_id = %new.user_id,
                superseded = superseded.rows_affected(),
                "Superseded previous active licenses"
            );
        }

        if new.bonus_coins > 0 {
            let credited = sqlx::query(
                r#"
                INSERT INTO coin_credits (user_id, payment_reference, coins)
                VALUES ($1, $2, $3)
                ON CONFLICT (payment_reference) DO NOTHING
                "#,
            )
            .bind(new.user_id)
            .bind(license_bonus_reference(&new, license.id))
            .bind(new.bonus_coins)
            .execute(&mut *tx)
            .await?;

            if credited.rows_affected() > 0 {
                sqlx::query("UPDATE users SET coin_balance = coin_balance + $2, updated_at = NOW() WHERE id = $1")
                    .bind(new.user_id)
                    .bind(new.bonus_coins)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        if let Some(customer_id) = &new.customer_id {
            sqlx::query(
                "UPDATE users SET stripe_customer_id = COALESCE(stripe_customer_id, $2) WHERE id = $1",
            )
            .bind(new.user_id)
            .bind(customer_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(LicenseActivation::Created(license))
    }

    async fn renew_license(
        &self,
        subscription_id: &str,
        current_period_end: Option<OffsetDateTime>,
    ) -> BillingResult<Option<License>> {
        let license = sqlx::query_as::<_, License>(&format!(
            r#"
            UPDATE licenses
            SET subscription_status = 'active',
                current_period_end = COALESCE($2, current_period_end),
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING {}
            "#,
            LICENSE_COLUMNS
        ))
        .bind(subscription_id)
        .bind(current_period_end)
        .fetch_optional(&self.pool)
        .await?;
        Ok(license)
    }

    async fn set_license_status(
        &self,
        subscription_id: &str,
        status: LicenseStatus,
    ) -> BillingResult<Option<License>> {
        let license = sqlx::query_as::<_, License>(&format!(
            r#"
            UPDATE licenses
            SET subscription_status = $2, updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING {}
            "#,
            LICENSE_COLUMNS
        ))
        .bind(subscription_id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await?;
        Ok(license)
    }

    async fn record_receipt(&self, new: NewReceipt) -> BillingResult<RecordedReceipt> {
        let by_reference = format!(
            "SELECT {} FROM receipts WHERE stripe_payment_intent_id = $1",
            RECEIPT_COLUMNS
        );

        if let Some(existing) = sqlx::query_as::<_, Receipt>(&by_reference)
            .bind(&new.payment_reference)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(RecordedReceipt {
                receipt: existing,
                created: false,
            });
        }

        let mut tx = self.pool.begin().await?;
        let year = new.issue_date.year();
        let value = allocate_yearly(&mut tx, RECEIPT_SEQUENCE_FAMILY, year).await?;

        let inserted = sqlx::query_as::<_, Receipt>(&format!(
            r#"
            INSERT INTO receipts
                (receipt_number, user_id, stripe_payment_intent_id, item_description, amount, currency, issue_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (stripe_payment_intent_id) DO NOTHING
            RETURNING {}
            "#,
            RECEIPT_COLUMNS
        ))
        .bind(format_document_number(RECEIPT_PREFIX, year, value))
        .bind(new.user_id)
        .bind(&new.payment_reference)
        .bind(&new.item_description)
        .bind(new.amount)
        .bind(&new.currency)
        .bind(new.issue_date)
        .fetch_optional(&mut *tx)
        .await?;

        match inserted {
            Some(receipt) => {
                tx.commit().await?;
                Ok(RecordedReceipt {
                    receipt,
                    created: true,
                })
            }
            None => {
                // Lost the race for this reference; the allocated number is rolled back
                drop(tx);
                let existing = sqlx::query_as::<_, Receipt>(&by_reference)
                    .bind(&new.payment_reference)
                    .fetch_one(&self.pool)
                    .await?;
                Ok(RecordedReceipt {
                    receipt: existing,
                    created: false,
                })
            }
        }
    }

    async fn find_receipt(&self, receipt_id: Uuid) -> BillingResult<Option<Receipt>> {
        let receipt = sqlx::query_as::<_, Receipt>(&format!(
            "SELECT {} FROM receipts WHERE id = $1",
            RECEIPT_COLUMNS
        ))
        .bind(receipt_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(receipt)
    }

    async fn find_receipt_by_number(&self, receipt_number: &str) -> BillingResult<Option<Receipt>> {
        let receipt = sqlx::query_as::<_, Receipt>(&format!(
            "SELECT {} FROM receipts WHERE receipt_number = $1",
            RECEIPT_COLUMNS
        ))
        .bind(receipt_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(receipt)
    }

    async fn mark_receipt_delivered(&self, receipt_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE receipts
            SET delivered_at = NOW(), delivery_attempts = delivery_attempts + 1, last_delivery_error = NULL
            WHERE id = $1
            "#,
        )
        .bind(receipt_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_delivery_failure(&self, receipt_id: Uuid, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE receipts
            SET delivery_attempts = delivery_attempts + 1, last_delivery_error = $2
            WHERE id = $1
            "#,
        )
        .bind(receipt_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_receipts(&self, limit: i64, max_attempts: i32) -> BillingResult<Vec<Receipt>> {
        let receipts = sqlx::query_as::<_, Receipt>(&format!(
            r#"
            SELECT {} FROM receipts
            WHERE delivered_at IS NULL AND delivery_attempts < $2
            ORDER BY created_at ASC
            LIMIT $1
            "#,
            RECEIPT_COLUMNS
        ))
        .bind(limit)
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await?;
        Ok(receipts)
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        // A single statement decides the claim, so two concurrent deliveries
        // of the same event cannot both win it.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE
            SET processing_result = 'processing',
                processing_started_at = NOW(),
                processed_at = NULL,
                error_message = NULL
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at < NOW() - make_interval(mins => $4))
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let result: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match result {
            Some((result,)) if result == "success" => EventClaim::Completed,
            _ => EventClaim::InFlight,
        })
    }

    async fn finish_webhook_event(&self, event_id: &str, error: Option<&str>) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = CASE WHEN $2::TEXT IS NULL THEN 'success' ELSE 'error' END,
                processed_at = NOW(),
                error_message = $2
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_webhook_events(&self, retention_days: i32) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM stripe_webhook_events
            WHERE processed_at IS NOT NULL
              AND processed_at < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(retention_days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Invoices and offers in their per-kind tables
#[derive(Clone)]
pub struct PgDocumentRepository {
    pool: PgPool,
}

impl PgDocumentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct DocumentRow {
    id: Uuid,
    number: String,
    recipient_name: String,
    recipient_email: String,
    issue_date: NaiveDate,
    due_date: NaiveDate,
    subtotal: Decimal,
    tax: Decimal,
    total_amount: Decimal,
    status: DocumentStatus,
    notes: Option<String>,
    created_by: Uuid,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl DocumentRow {
    fn into_document(self, kind: DocumentKind, line_items: Vec<LineItem>) -> Document {
        Document {
            kind,
            id: self.id,
            number: self.number,
            recipient_name: self.recipient_name,
            recipient_email: self.recipient_email,
            issue_date: self.issue_date,
            due_date: self.due_date,
            subtotal: self.subtotal,
            tax: self.tax,
            total_amount: self.total_amount,
            status: self.status,
            notes: self.notes,
            created_by: self.created_by,
            line_items,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn header_columns(kind: DocumentKind) -> String {
    format!(
        "id, {} AS number, recipient_name, recipient_email, issue_date, {} AS due_date, \
         subtotal, tax, total_amount, status, notes, created_by, created_at, updated_at",
        kind.number_column(),
        kind.date_column()
    )
}

async fn insert_line_items(
    conn: &mut sqlx::PgConnection,
    kind: DocumentKind,
    document_id: Uuid,
    document: &ValidatedDocument,
) -> BillingResult<()> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {} ({}, position, description, quantity, unit_price, amount) ",
        kind.items_table(),
        kind.items_foreign_key()
    ));
    builder.push_values(document.line_items.iter().enumerate(), |mut row, (position, item)| {
        row.push_bind(document_id)
            .push_bind(position as i32)
            .push_bind(item.description.trim().to_string())
            .push_bind(item.quantity)
            .push_bind(item.unit_price)
            .push_bind(item.quantity * item.unit_price);
    });
    builder.build().execute(&mut *conn).await?;
    Ok(())
}

impl PgDocumentRepository {
    async fn load(&self, kind: DocumentKind, id: Uuid) -> BillingResult<Option<Document>> {
        let header = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {} FROM {} WHERE id = $1",
            header_columns(kind),
            kind.table()
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(header) = header else {
            return Ok(None);
        };

        let items = sqlx::query_as::<_, LineItem>(&format!(
            "SELECT id, position, description, quantity, unit_price, amount FROM {} WHERE {} = $1 ORDER BY position",
            kind.items_table(),
            kind.items_foreign_key()
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(header.into_document(kind, items)))
    }
}

#[async_trait]
impl DocumentRepository for PgDocumentRepository {
    async fn create(
        &self,
        kind: DocumentKind,
        document: &ValidatedDocument,
        created_by: Uuid,
        issue_date: NaiveDate,
    ) -> BillingResult<Document> {
        let mut tx = self.pool.begin().await?;

        let value = allocate(&mut tx, kind.sequence_name()).await?;
        let number = format_document_number(kind.number_prefix(), issue_date.year(), value);

        let (id,): (Uuid,) = sqlx::query_as(&format!(
            r#"
            INSERT INTO {} ({}, recipient_name, recipient_email, issue_date, {}, subtotal, tax, total_amount, status, notes, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'draft', $9, $10)
            RETURNING id
            "#,
            kind.table(),
            kind.number_column(),
            kind.date_column()
        ))
        .bind(&number)
        .bind(&document.recipient_name)
        .bind(&document.recipient_email)
        .bind(issue_date)
        .bind(document.due_date)
        .bind(document.totals.subtotal)
        .bind(document.totals.tax)
        .bind(document.totals.total)
        .bind(&document.notes)
        .bind(created_by)
        .fetch_one(&mut *tx)
        .await?;

        insert_line_items(&mut tx, kind, id, document).await?;
        tx.commit().await?;

        self.load(kind, id)
            .await?
            .ok_or_else(|| BillingError::Internal(format!("{} {} missing after insert", kind, number)))
    }

    async fn update(
        &self,
        kind: DocumentKind,
        id: Uuid,
        document: &ValidatedDocument,
    ) -> BillingResult<Document> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET recipient_name = $2, recipient_email = $3, {} = $4,
                subtotal = $5, tax = $6, total_amount = $7, notes = $8, updated_at = NOW()
            WHERE id = $1
            "#,
            kind.table(),
            kind.date_column()
        ))
        .bind(id)
        .bind(&document.recipient_name)
        .bind(&document.recipient_email)
        .bind(document.due_date)
        .bind(document.totals.subtotal)
        .bind(document.totals.tax)
        .bind(document.totals.total)
        .bind(&document.notes)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("{} {}", kind, id)));
        }

        sqlx::query(&format!(
            "DELETE FROM {} WHERE {} = $1",
            kind.items_table(),
            kind.items_foreign_key()
        ))
        .bind(id)
        .execute(&mut *tx)
        .await?;

        insert_line_items(&mut tx, kind, id, document).await?;
        tx.commit().await?;

        self.load(kind, id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("{} {}", kind, id)))
    }

    async fn delete(&self, kind: DocumentKind, id: Uuid) -> BillingResult<()> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", kind.table()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("{} {}", kind, id)));
        }
        Ok(())
    }

    async fn find(&self, kind: DocumentKind, id: Uuid) -> BillingResult<Option<Document>> {
        self.load(kind, id).await
    }

    async fn list(&self, kind: DocumentKind) -> BillingResult<Vec<DocumentSummary>> {
        let rows = sqlx::query_as::<_, DocumentSummary>(&format!(
            r#"
            SELECT id, {} AS number, recipient_name, recipient_email, issue_date, {} AS due_date, total_amount, status
            FROM {}
            ORDER BY created_at DESC, {} DESC
            "#,
            kind.number_column(),
            kind.date_column(),
            kind.table(),
            kind.number_column()
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn transition_status(
        &self,
        kind: DocumentKind,
        id: Uuid,
        from: DocumentStatus,
        to: DocumentStatus,
    ) -> BillingResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
            kind.table()
        ))
        .bind(id)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<(Uuid,)> =
                sqlx::query_as(&format!("SELECT id FROM {} WHERE id = $1", kind.table()))
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                return Err(BillingError::NotFound(format!("{} {}", kind, id)));
            }
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{validate, DocumentInput, LineItemInput};
    use evisit_shared::PlanType;
    use rust_decimal_macros::dec;

    async fn pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = PgPool::connect(&url).await.unwrap();
        evisit_shared::run_migrations(&pool).await.unwrap();
        pool
    }

    async fn insert_user(pool: &PgPool) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO users (id, name, email, role) VALUES ($1, 'Test', $2, 'admin')")
            .bind(id)
            .bind(format!("{}@example.com", id))
            .execute(pool)
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_replayed_license_activation_credits_once() {
        let pool = pool().await;
        let store = PgBillingStore::new(pool.clone());
        let user_id = insert_user(&pool).await;
        let sub = format!("sub_{}", Uuid::new_v4().simple());

        let new = NewLicense {
            user_id,
            stripe_subscription_id: Some(sub.clone()),
            customer_id: Some(format!("cus_{}", Uuid::new_v4().simple())),
            plan: PlanType::Yearly,
            current_period_end: None,
            stripe_session_id: None,
            bonus_coins: 25,
        };

        assert!(matches!(
            store.activate_license(new.clone()).await.unwrap(),
            LicenseActivation::Created(_)
        ));
        assert!(matches!(
            store.activate_license(new).await.unwrap(),
            LicenseActivation::AlreadyExists(_)
        ));

        let user = store.find_user(user_id).await.unwrap().unwrap();
        assert_eq!(user.coin_balance, 25);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_concurrent_receipts_get_distinct_numbers() {
        let pool = pool().await;
        let store = PgBillingStore::new(pool.clone());
        let user_id = insert_user(&pool).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .record_receipt(NewReceipt {
                        user_id,
                        payment_reference: format!("pi_{}", Uuid::new_v4().simple()),
                        item_description: "10 E-Tokens Package".into(),
                        amount: 500,
                        currency: "eur".into(),
                        issue_date: chrono::Utc::now().date_naive(),
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap().receipt.receipt_number);
        }
        numbers.sort();
        numbers.dedup();
        assert_eq!(numbers.len(), 8);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_document_round_trip_and_status_cas() {
        let pool = pool().await;
        let repo = PgDocumentRepository::new(pool.clone());
        let admin = insert_user(&pool).await;

        let document = validate(DocumentInput {
            recipient_name: "Prishtina Hotels".into(),
            recipient_email: "ops@prishtina.example".into(),
            due_date: NaiveDate::from_ymd_opt(2026, 12, 31),
            tax: Some(dec!(1.50)),
            notes: None,
            line_items: vec![LineItemInput {
                description: "Featured listing".into(),
                quantity: dec!(2),
                unit_price: dec!(10.00),
            }],
        })
        .unwrap();

        let created = repo
            .create(DocumentKind::Invoice, &document, admin, chrono::Utc::now().date_naive())
            .await
            .unwrap();
        assert_eq!(created.total_amount, dec!(21.50));
        assert_eq!(created.line_items.len(), 1);
        assert_eq!(created.status, DocumentStatus::Draft);

        assert!(repo
            .transition_status(DocumentKind::Invoice, created.id, DocumentStatus::Draft, DocumentStatus::Sent)
            .await
            .unwrap());
        assert!(!repo
            .transition_status(DocumentKind::Invoice, created.id, DocumentStatus::Draft, DocumentStatus::Sent)
            .await
            .unwrap());

        repo.delete(DocumentKind::Invoice, created.id).await.unwrap();
        assert!(repo.find(DocumentKind::Invoice, created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_webhook_claim_is_exclusive() {
        let pool = pool().await;
        let store = PgBillingStore::new(pool);
        let event_id = format!("evt_{}", Uuid::new_v4().simple());
        let now = OffsetDateTime::now_utc();

        let first = store.claim_webhook_event(&event_id, "invoice.paid", now).await.unwrap();
        let concurrent = store.claim_webhook_event(&event_id, "invoice.paid", now).await.unwrap();
        assert_eq!(first, EventClaim::Claimed);
        assert_eq!(concurrent, EventClaim::InFlight);

        store.finish_webhook_event(&event_id, Some("boom")).await.unwrap();
        let retry = store.claim_webhook_event(&event_id, "invoice.paid", now).await.unwrap();
        assert_eq!(retry, EventClaim::Claimed);

        store.finish_webhook_event(&event_id, None).await.unwrap();
        let replay = store.claim_webhook_event(&event_id, "invoice.paid", now).await.unwrap();
        assert_eq!(replay, EventClaim::Completed);
    }
}
