//! Invoices and offers
//!
//! Both document kinds share one model: a numbered header, an ordered set of
//! line items and totals that are always recomputed from those items.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use evisit_shared::DocumentStatus;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::{document_email, Notifier};
use crate::error::{BillingError, BillingResult};
use crate::pdf::{
    escape_html, format_long_date, format_usd, render_template, CompanyProfile, PdfRenderer,
    TemplateSet,
};
use crate::sequence::{INVOICE_SEQUENCE, OFFER_SEQUENCE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Invoice,
    Offer,
}

impl DocumentKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Invoice => "Invoice",
            Self::Offer => "Offer",
        }
    }

    pub fn number_prefix(&self) -> &'static str {
        match self {
            Self::Invoice => "INV",
            Self::Offer => "OFFER",
        }
    }

    pub fn sequence_name(&self) -> &'static str {
        match self {
            Self::Invoice => INVOICE_SEQUENCE,
            Self::Offer => OFFER_SEQUENCE,
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            Self::Invoice => "invoices",
            Self::Offer => "offers",
        }
    }

    pub(crate) fn number_column(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice_number",
            Self::Offer => "offer_number",
        }
    }

    /// Column holding the due date (invoices) or valid-until date (offers)
    pub(crate) fn date_column(&self) -> &'static str {
        match self {
            Self::Invoice => "due_date",
            Self::Offer => "valid_until",
        }
    }

    pub(crate) fn items_table(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice_line_items",
            Self::Offer => "offer_line_items",
        }
    }

    pub(crate) fn items_foreign_key(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice_id",
            Self::Offer => "offer_id",
        }
    }

    /// Statuses this kind can ever hold
    pub fn allows(&self, status: DocumentStatus) -> bool {
        match status {
            DocumentStatus::Draft | DocumentStatus::Sent => true,
            DocumentStatus::Paid | DocumentStatus::Cancelled => *self == Self::Invoice,
            DocumentStatus::Accepted | DocumentStatus::Declined => *self == Self::Offer,
        }
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invoice => write!(f, "invoice"),
            Self::Offer => write!(f, "offer"),
        }
    }
}

/// Line item as submitted by a caller
#[derive(Debug, Clone, Deserialize)]
pub struct LineItemInput {
    #[serde(default)]
    pub description: String,
    pub quantity: Decimal,
    #[serde(alias = "unitPrice")]
    pub unit_price: Decimal,
}

/// Create/update payload for an invoice or offer
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentInput {
    #[serde(default, alias = "recipientName")]
    pub recipient_name: String,
    #[serde(default, alias = "recipientEmail")]
    pub recipient_email: String,
    #[serde(default, alias = "dueDate", alias = "valid_until", alias = "validUntil")]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub tax: Option<Decimal>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, alias = "lineItems")]
    pub line_items: Vec<LineItemInput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

/// Payload that passed validation, with totals computed from its items
#[derive(Debug, Clone)]
pub struct ValidatedDocument {
    pub recipient_name: String,
    pub recipient_email: String,
    pub due_date: NaiveDate,
    pub notes: Option<String>,
    pub line_items: Vec<LineItemInput>,
    pub totals: Totals,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct LineItem {
    pub id: Uuid,
    pub position: i32,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
}

/// Fully hydrated invoice or offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    pub kind: DocumentKind,
    pub id: Uuid,
    pub number: String,
    pub recipient_name: String,
    pub recipient_email: String,
    pub issue_date: NaiveDate,
    /// Due date for invoices, valid-until date for offers
    pub due_date: NaiveDate,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub total_amount: Decimal,
    pub status: DocumentStatus,
    pub notes: Option<String>,
    pub created_by: Uuid,
    pub line_items: Vec<LineItem>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// List row without line items
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct DocumentSummary {
    pub id: Uuid,
    pub number: String,
    pub recipient_name: String,
    pub recipient_email: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub total_amount: Decimal,
    pub status: DocumentStatus,
}

/// `subtotal = Σ quantity × unit_price`, `total = subtotal + tax`
pub fn compute_totals(items: &[LineItemInput], tax: Decimal) -> Totals {
    let subtotal = items
        .iter()
        .map(|item| item.quantity * item.unit_price)
        .sum::<Decimal>();
    Totals {
        subtotal,
        tax,
        total: subtotal + tax,
    }
}

pub fn validate(input: DocumentInput) -> BillingResult<ValidatedDocument> {
    let recipient_name = input.recipient_name.trim().to_string();
    let recipient_email = input.recipient_email.trim().to_string();

    if recipient_name.is_empty() {
        return Err(BillingError::Validation("Recipient name is required".into()));
    }
    if recipient_email.is_empty() {
        return Err(BillingError::Validation("Recipient email is required".into()));
    }
    if !recipient_email.contains('@') {
        return Err(BillingError::Validation(format!(
            "Invalid recipient email: {}",
            recipient_email
        )));
    }
    let due_date = input
        .due_date
        .ok_or_else(|| BillingError::Validation("Due date is required".into()))?;
    if input.line_items.is_empty() {
        return Err(BillingError::Validation(
            "At least one line item is required".into(),
        ));
    }
    for (index, item) in input.line_items.iter().enumerate() {
        if item.description.trim().is_empty() {
            return Err(BillingError::Validation(format!(
                "Line item {} needs a description",
                index + 1
            )));
        }
        if item.quantity.is_sign_negative() || item.unit_price.is_sign_negative() {
            return Err(BillingError::Validation(format!(
                "Line item {} has a negative quantity or unit price",
                index + 1
            )));
        }
    }

    let totals = compute_totals(&input.line_items, input.tax.unwrap_or(Decimal::ZERO));

    Ok(ValidatedDocument {
        recipient_name,
        recipient_email,
        due_date,
        notes: input.notes.filter(|n| !n.trim().is_empty()),
        line_items: input.line_items,
        totals,
    })
}

/// Check a status change requested through the status endpoint or `send`.
///
/// Only drafts may be sent; terminal statuses are reached from `sent` and
/// must belong to the document kind.
pub fn check_transition(
    kind: DocumentKind,
    from: DocumentStatus,
    to: DocumentStatus,
) -> BillingResult<()> {
    if !kind.allows(to) {
        return Err(BillingError::Validation(format!(
            "Status '{}' is not valid for an {}",
            to, kind
        )));
    }
    match to {
        DocumentStatus::Draft => Err(BillingError::InvalidState(format!(
            "{} {} cannot return to draft",
            kind.label(),
            from
        ))),
        DocumentStatus::Sent if from == DocumentStatus::Draft => Ok(()),
        DocumentStatus::Sent => Err(BillingError::InvalidState(format!(
            "Only draft documents can be sent (current status: {})",
            from
        ))),
        _ if from == DocumentStatus::Sent => Ok(()),
        _ => Err(BillingError::InvalidState(format!(
            "Cannot move {} from {} to {}",
            kind, from, to
        ))),
    }
}

#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Allocate a number, insert header and items, commit, then re-read
    async fn create(
        &self,
        kind: DocumentKind,
        document: &ValidatedDocument,
        created_by: Uuid,
        issue_date: NaiveDate,
    ) -> BillingResult<Document>;

    /// Replace header fields and the whole line item set. Number, issue date
    /// and status are kept.
    async fn update(
        &self,
        kind: DocumentKind,
        id: Uuid,
        document: &ValidatedDocument,
    ) -> BillingResult<Document>;

    async fn delete(&self, kind: DocumentKind, id: Uuid) -> BillingResult<()>;

    async fn find(&self, kind: DocumentKind, id: Uuid) -> BillingResult<Option<Document>>;

    async fn list(&self, kind: DocumentKind) -> BillingResult<Vec<DocumentSummary>>;

    /// Compare-and-set the status. Returns false when the current status is
    /// no longer `from`.
    async fn transition_status(
        &self,
        kind: DocumentKind,
        id: Uuid,
        from: DocumentStatus,
        to: DocumentStatus,
    ) -> BillingResult<bool>;
}

/// Admin-facing document operations
#[derive(Clone)]
pub struct DocumentService {
    repo: Arc<dyn DocumentRepository>,
    renderer: Arc<dyn PdfRenderer>,
    notifier: Arc<dyn Notifier>,
    templates: Arc<TemplateSet>,
    company: CompanyProfile,
}

impl DocumentService {
    pub fn new(
        repo: Arc<dyn DocumentRepository>,
        renderer: Arc<dyn PdfRenderer>,
        notifier: Arc<dyn Notifier>,
        templates: Arc<TemplateSet>,
        company: CompanyProfile,
    ) -> Self {
        Self {
            repo,
            renderer,
            notifier,
            templates,
            company,
        }
    }

    pub async fn create(
        &self,
        kind: DocumentKind,
        input: DocumentInput,
        created_by: Uuid,
    ) -> BillingResult<Document> {
        let document = validate(input)?;
        let created = self
            .repo
            .create(kind, &document, created_by, Utc::now().date_naive())
            .await?;

        tracing::info!(
            kind = %kind,
            document_number = %created.number,
            total = %created.total_amount,
            "Created document"
        );

        Ok(created)
    }

    pub async fn update(
        &self,
        kind: DocumentKind,
        id: Uuid,
        input: DocumentInput,
    ) -> BillingResult<Document> {
        self.get(kind, id).await?;
        let document = validate(input)?;
        let updated = self.repo.update(kind, id, &document).await?;

        tracing::info!(
            kind = %kind,
            document_number = %updated.number,
            total = %updated.total_amount,
            "Updated document"
        );

        Ok(updated)
    }

    pub async fn delete(&self, kind: DocumentKind, id: Uuid) -> BillingResult<()> {
        self.repo.delete(kind, id).await?;
        tracing::info!(kind = %kind, document_id = %id, "Deleted document");
        Ok(())
    }

    pub async fn get(&self, kind: DocumentKind, id: Uuid) -> BillingResult<Document> {
        self.repo
            .find(kind, id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("{} {}", kind, id)))
    }

    pub async fn list(&self, kind: DocumentKind) -> BillingResult<Vec<DocumentSummary>> {
        self.repo.list(kind).await
    }

    /// Set a status directly. Sending goes through [`Self::send`].
    pub async fn update_status(
        &self,
        kind: DocumentKind,
        id: Uuid,
        status: DocumentStatus,
    ) -> BillingResult<Document> {
        if status == DocumentStatus::Sent {
            return Err(BillingError::InvalidState(
                "Use the send operation to mark a document as sent".into(),
            ));
        }
        let current = self.get(kind, id).await?;
        check_transition(kind, current.status, status)?;

        if !self
            .repo
            .transition_status(kind, id, current.status, status)
            .await?
        {
            return Err(BillingError::InvalidState(format!(
                "{} {} changed status concurrently",
                kind.label(),
                current.number
            )));
        }

        self.get(kind, id).await
    }

    pub fn render_html(&self, document: &Document) -> String {
        let template = match document.kind {
            DocumentKind::Invoice => &self.templates.invoice,
            DocumentKind::Offer => &self.templates.offer,
        };
        render_template(template, &document_values(document, &self.company))
    }

    pub async fn render_pdf(&self, kind: DocumentKind, id: Uuid) -> BillingResult<(Document, Vec<u8>)> {
        let document = self.get(kind, id).await?;
        let pdf = self.renderer.render(&self.render_html(&document)).await?;
        Ok((document, pdf))
    }

    /// Render, email to the recipient, then mark as sent.
    ///
    /// Fails with InvalidState before any side effect unless the document is
    /// a draft. The status is untouched when rendering or email fails.
    pub async fn send(&self, kind: DocumentKind, id: Uuid) -> BillingResult<Document> {
        let document = self.get(kind, id).await?;
        check_transition(kind, document.status, DocumentStatus::Sent)?;

        let pdf = self.renderer.render(&self.render_html(&document)).await?;
        let message = document_email(&document, pdf, &self.company);
        if !self.notifier.send(message).await? {
            return Err(BillingError::Email(format!(
                "{} {} could not be emailed to {}",
                kind.label(),
                document.number,
                document.recipient_email
            )));
        }

        if !self
            .repo
            .transition_status(kind, id, DocumentStatus::Draft, DocumentStatus::Sent)
            .await?
        {
            tracing::warn!(
                kind = %kind,
                document_number = %document.number,
                "Document left draft while it was being sent"
            );
            return Err(BillingError::InvalidState(format!(
                "{} {} is no longer a draft",
                kind.label(),
                document.number
            )));
        }

        tracing::info!(
            kind = %kind,
            document_number = %document.number,
            recipient = %document.recipient_email,
            "Document sent"
        );

        self.get(kind, id).await
    }
}

fn document_values(document: &Document, company: &CompanyProfile) -> Vec<(&'static str, String)> {
    let rows = document
        .line_items
        .iter()
        .map(|item| {
            format!(
                r#"<tr><td>{}</td><td class="amount">{}</td><td class="amount">{}</td><td class="amount">{}</td></tr>"#,
                escape_html(&item.description),
                item.quantity.normalize(),
                format_usd(item.unit_price),
                format_usd(item.amount),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let date_key = match document.kind {
        DocumentKind::Invoice => "due_date",
        DocumentKind::Offer => "valid_until",
    };

    let mut values = company.template_values();
    values.extend([
        ("document_number", document.number.clone()),
        ("recipient_name", escape_html(&document.recipient_name)),
        ("recipient_email", escape_html(&document.recipient_email)),
        ("issue_date", format_long_date(document.issue_date)),
        (date_key, format_long_date(document.due_date)),
        ("status", document.status.title().to_string()),
        ("line_items", rows),
        ("subtotal", format_usd(document.subtotal)),
        ("tax", format_usd(document.tax)),
        ("total_amount", format_usd(document.total_amount)),
        (
            "notes",
            escape_html(document.notes.as_deref().unwrap_or_default()),
        ),
        ("current_year", Utc::now().year().to_string()),
    ]);
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn item(description: &str, quantity: Decimal, unit_price: Decimal) -> LineItemInput {
        LineItemInput {
            description: description.to_string(),
            quantity,
            unit_price,
        }
    }

    fn input(items: Vec<LineItemInput>) -> DocumentInput {
        DocumentInput {
            recipient_name: "Dardania Travel".into(),
            recipient_email: "billing@dardania.example".into(),
            due_date: NaiveDate::from_ymd_opt(2026, 11, 30),
            tax: None,
            notes: None,
            line_items: items,
        }
    }

    #[test]
    fn test_totals_from_line_items() {
        let doc = validate(input(vec![
            item("A", dec!(2), dec!(10.00)),
            item("B", dec!(1), dec!(5.00)),
        ]))
        .unwrap();
        assert_eq!(doc.totals.subtotal, dec!(25.00));
        assert_eq!(doc.totals.total, dec!(25.00));
    }

    #[test]
    fn test_tax_is_added_and_may_be_negative() {
        let items = vec![item("Listing boost", dec!(3), dec!(1.10))];
        let totals = compute_totals(&items, dec!(0.70));
        assert_eq!(totals.subtotal, dec!(3.30));
        assert_eq!(totals.total, dec!(4.00));

        let discounted = compute_totals(&items, dec!(-0.30));
        assert_eq!(discounted.total, dec!(3.00));
    }

    #[test]
    fn test_totals_are_exact_for_fractional_prices() {
        let items: Vec<_> = (0..10).map(|_| item("x", dec!(1), dec!(0.10))).collect();
        assert_eq!(compute_totals(&items, Decimal::ZERO).subtotal, dec!(1.00));
    }

    #[test]
    fn test_empty_line_items_rejected() {
        let err = validate(input(vec![])).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[test]
    fn test_missing_recipient_and_due_date_rejected() {
        let mut missing_name = input(vec![item("A", dec!(1), dec!(1))]);
        missing_name.recipient_name = "  ".into();
        assert!(matches!(validate(missing_name), Err(BillingError::Validation(_))));

        let mut missing_date = input(vec![item("A", dec!(1), dec!(1))]);
        missing_date.due_date = None;
        assert!(matches!(validate(missing_date), Err(BillingError::Validation(_))));
    }

    #[test]
    fn test_negative_quantity_rejected() {
        let err = validate(input(vec![item("A", dec!(-1), dec!(1))])).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[test]
    fn test_camel_case_payload_accepted() {
        let payload = serde_json::json!({
            "recipientName": "Arber",
            "recipientEmail": "arber@example.com",
            "validUntil": "2026-12-01",
            "lineItems": [{"description": "Banner", "quantity": 2, "unitPrice": "12.50"}]
        });
        let parsed: DocumentInput = serde_json::from_value(payload).unwrap();
        let doc = validate(parsed).unwrap();
        assert_eq!(doc.totals.total, dec!(25.00));
        assert_eq!(doc.due_date, NaiveDate::from_ymd_opt(2026, 12, 1).unwrap());
    }

    #[test]
    fn test_only_drafts_can_be_sent() {
        use DocumentStatus::*;
        assert!(check_transition(DocumentKind::Invoice, Draft, Sent).is_ok());
        for from in [Sent, Paid, Cancelled] {
            let err = check_transition(DocumentKind::Invoice, from, Sent).unwrap_err();
            assert!(matches!(err, BillingError::InvalidState(_)));
        }
    }

    #[test]
    fn test_terminal_status_depends_on_kind() {
        use DocumentStatus::*;
        assert!(check_transition(DocumentKind::Invoice, Sent, Paid).is_ok());
        assert!(check_transition(DocumentKind::Offer, Sent, Accepted).is_ok());
        assert!(matches!(
            check_transition(DocumentKind::Offer, Sent, Paid),
            Err(BillingError::Validation(_))
        ));
        assert!(matches!(
            check_transition(DocumentKind::Invoice, Draft, Paid),
            Err(BillingError::InvalidState(_))
        ));
        assert!(matches!(
            check_transition(DocumentKind::Invoice, Sent, Draft),
            Err(BillingError::InvalidState(_))
        ));
    }
}
