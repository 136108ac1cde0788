//! Document number allocation
//!
//! Every sequence is a row in `document_sequences`. Allocation locks the row
//! for the rest of the caller's transaction, so concurrent allocations of the
//! same name serialize and never observe the same value. Values burned by a
//! rolled-back transaction are skipped, never reused.

use sqlx::PgConnection;

use crate::error::{BillingError, BillingResult};

pub const INVOICE_SEQUENCE: &str = "invoice";
pub const OFFER_SEQUENCE: &str = "offer";
pub const RECEIPT_SEQUENCE_FAMILY: &str = "receipt";

/// Allocate the next value of a pre-seeded sequence.
///
/// Must be called on a connection with an open transaction; the row lock is
/// held until that transaction ends. Returns the pre-increment value.
pub async fn allocate(conn: &mut PgConnection, name: &str) -> BillingResult<i64> {
    let current: Option<(i64,)> = sqlx::query_as(
        "SELECT current_value FROM document_sequences WHERE name = $1 FOR UPDATE",
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((value,)) = current else {
        tracing::error!(sequence = %name, "Document sequence row missing");
        return Err(BillingError::SequenceNotFound(name.to_string()));
    };

    sqlx::query("UPDATE document_sequences SET current_value = current_value + 1 WHERE name = $1")
        .bind(name)
        .execute(&mut *conn)
        .await?;

    tracing::debug!(sequence = %name, value, "Allocated sequence value");

    Ok(value)
}

/// Allocate from a per-year sequence such as `receipt-2026`.
///
/// The row is created on first use for the year and then allocated through
/// the same locked path as [`allocate`].
pub async fn allocate_yearly(conn: &mut PgConnection, family: &str, year: i32) -> BillingResult<i64> {
    let name = yearly_sequence_name(family, year);

    sqlx::query(
        "INSERT INTO document_sequences (name, current_value) VALUES ($1, 1) ON CONFLICT (name) DO NOTHING",
    )
    .bind(&name)
    .execute(&mut *conn)
    .await?;

    allocate(conn, &name).await
}

pub fn yearly_sequence_name(family: &str, year: i32) -> String {
    format!("{}-{}", family, year)
}

/// Render `PREFIX-YEAR-NNNN`. Values wider than four digits are kept whole.
pub fn format_document_number(prefix: &str, year: i32, value: i64) -> String {
    format!("{}-{}-{:04}", prefix, year, value)
}
