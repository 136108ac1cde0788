//! Receipt issuance
//!
//! Recording a receipt is part of fulfillment and must succeed on its own.
//! Rendering (and later emailing) is best-effort and can be retried from the
//! stored record at any time.

use std::sync::Arc;

use chrono::Utc;
use evisit_shared::User;

use crate::error::{BillingError, BillingResult};
use crate::pdf::{
    escape_html, format_day_month_year, format_eur_cents, render_template, CompanyProfile,
    PdfRenderer, TemplateSet,
};
use crate::purchase::Purchase;
use crate::store::{BillingStore, NewReceipt, Receipt, RecordedReceipt};

pub const RECEIPT_PREFIX: &str = "INV";

/// A completed payment that deserves a receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptPayment {
    /// Payment intent, invoice or session ID; one receipt per reference
    pub reference: String,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub purchase: Purchase,
}

/// Outcome of [`ReceiptIssuer::issue`]. The record is always committed; the
/// document may have failed to render.
#[derive(Debug)]
pub struct IssuedReceipt {
    pub receipt: Receipt,
    pub created: bool,
    pub document: BillingResult<Vec<u8>>,
}

/// Line shown on the receipt for a purchase
pub fn describe(purchase: &Purchase) -> String {
    match purchase {
        Purchase::License {
            plan, bonus_coins, ..
        } => {
            let term = plan.map(|p| p.label()).unwrap_or("1 Year");
            if *bonus_coins > 0 {
                format!("E-Visit Pro License ({}) + {} E-Token Bonus", term, bonus_coins)
            } else {
                format!("E-Visit Pro License ({})", term)
            }
        }
        Purchase::CoinPackage { coins, .. } => format!("{} E-Tokens Package", coins),
        Purchase::Unknown => "E-Visit Purchase".to_string(),
    }
}

#[derive(Clone)]
pub struct ReceiptIssuer {
    store: Arc<dyn BillingStore>,
    renderer: Arc<dyn PdfRenderer>,
    templates: Arc<TemplateSet>,
    company: CompanyProfile,
}

impl ReceiptIssuer {
    pub fn new(
        store: Arc<dyn BillingStore>,
        renderer: Arc<dyn PdfRenderer>,
        templates: Arc<TemplateSet>,
        company: CompanyProfile,
    ) -> Self {
        Self {
            store,
            renderer,
            templates,
            company,
        }
    }

    pub fn company(&self) -> &CompanyProfile {
        &self.company
    }

    /// Persist the receipt, or return the one already recorded for this
    /// payment reference.
    pub async fn record(&self, payment: &ReceiptPayment, user: &User) -> BillingResult<RecordedReceipt> {
        if payment.amount < 0 {
            return Err(BillingError::Validation(format!(
                "Receipt amount cannot be negative: {}",
                payment.amount
            )));
        }

        let recorded = self
            .store
            .record_receipt(NewReceipt {
                user_id: user.id,
                payment_reference: payment.reference.clone(),
                item_description: describe(&payment.purchase),
                amount: payment.amount,
                currency: payment.currency.to_lowercase(),
                issue_date: Utc::now().date_naive(),
            })
            .await?;

        if recorded.created {
            tracing::info!(
                receipt_number = %recorded.receipt.receipt_number,
                user_id = %user.id,
                payment_reference = %payment.reference,
                amount = payment.amount,
                "Receipt recorded"
            );
        } else {
            tracing::info!(
                receipt_number = %recorded.receipt.receipt_number,
                payment_reference = %payment.reference,
                "Receipt already recorded for payment"
            );
        }

        Ok(recorded)
    }

    pub fn render_html(&self, receipt: &Receipt, user: &User) -> String {
        let amount = format_eur_cents(receipt.amount);
        let row = format!(
            r#"<tr><td>{}</td><td class="amount">1</td><td class="amount">{}</td><td class="amount">{}</td></tr>"#,
            escape_html(&receipt.item_description),
            amount,
            amount,
        );

        let mut values = self.company.template_values();
        values.extend([
            ("receipt_number", receipt.receipt_number.clone()),
            ("issue_date", format_day_month_year(receipt.issue_date)),
            ("customer_name", escape_html(&user.full_name())),
            ("customer_email", escape_html(&user.email)),
            ("line_items", row),
            ("subtotal", amount.clone()),
            ("tax_amount", format_eur_cents(0)),
            ("total", amount),
            ("payment_method", "Card".to_string()),
            ("transaction_id", escape_html(&receipt.stripe_payment_intent_id)),
        ]);

        render_template(&self.templates.receipt, &values)
    }

    pub async fn render(&self, receipt: &Receipt, user: &User) -> BillingResult<Vec<u8>> {
        self.renderer.render(&self.render_html(receipt, user)).await
    }

    /// Record, then render. A render failure is returned inside the result
    /// and never undoes the record.
    pub async fn issue(&self, payment: &ReceiptPayment, user: &User) -> BillingResult<IssuedReceipt> {
        let RecordedReceipt { receipt, created } = self.record(payment, user).await?;

        let document = self.render(&receipt, user).await;
        if let Err(e) = &document {
            tracing::error!(
                receipt_number = %receipt.receipt_number,
                error = %e,
                "Receipt rendering failed - non-fatal, record kept"
            );
        }

        Ok(IssuedReceipt {
            receipt,
            created,
            document,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, NaiveDate};
    use crate::store::InMemoryBillingStore;
    use crate::testing::{company, sample_user, templates, StaticRenderer};
    use evisit_shared::PlanType;

    fn issuer(store: Arc<InMemoryBillingStore>, renderer: StaticRenderer) -> ReceiptIssuer {
        ReceiptIssuer::new(store, Arc::new(renderer), Arc::new(templates()), company())
    }

    fn coin_payment(reference: &str) -> ReceiptPayment {
        ReceiptPayment {
            reference: reference.to_string(),
            amount: 999,
            currency: "EUR".into(),
            purchase: Purchase::CoinPackage {
                user_id: None,
                coins: 50,
            },
        }
    }

    #[test]
    fn test_descriptions() {
        assert_eq!(
            describe(&Purchase::License {
                user_id: None,
                plan: Some(PlanType::Yearly),
                bonus_coins: 20
            }),
            "E-Visit Pro License (1 Year) + 20 E-Token Bonus"
        );
        assert_eq!(
            describe(&Purchase::License {
                user_id: None,
                plan: Some(PlanType::Monthly),
                bonus_coins: 0
            }),
            "E-Visit Pro License (1 Month)"
        );
        assert_eq!(
            describe(&Purchase::CoinPackage {
                user_id: None,
                coins: 100
            }),
            "100 E-Tokens Package"
        );
        assert_eq!(describe(&Purchase::Unknown), "E-Visit Purchase");
    }

    #[tokio::test]
    async fn test_issue_records_and_renders() {
        let store = Arc::new(InMemoryBillingStore::new());
        let user = store.insert_user(sample_user());
        let issuer = issuer(store.clone(), StaticRenderer::ok());

        let issued = issuer.issue(&coin_payment("pi_1"), &user).await.unwrap();
        let year = Utc::now().year();
        assert!(issued.created);
        assert_eq!(issued.receipt.receipt_number, format!("INV-{}-0001", year));
        assert_eq!(issued.receipt.item_description, "50 E-Tokens Package");
        assert_eq!(issued.receipt.currency, "eur");
        assert!(issued.document.is_ok());
    }

    #[tokio::test]
    async fn test_same_payment_reference_is_not_duplicated() {
        let store = Arc::new(InMemoryBillingStore::new());
        let user = store.insert_user(sample_user());
        let issuer = issuer(store.clone(), StaticRenderer::ok());

        let first = issuer.record(&coin_payment("pi_1"), &user).await.unwrap();
        let second = issuer.record(&coin_payment("pi_1"), &user).await.unwrap();
        let third = issuer.record(&coin_payment("pi_2"), &user).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.receipt.id, second.receipt.id);
        assert_ne!(first.receipt.receipt_number, third.receipt.receipt_number);
        assert_eq!(store.receipt_count(), 2);
    }

    #[tokio::test]
    async fn test_render_failure_keeps_record() {
        let store = Arc::new(InMemoryBillingStore::new());
        let user = store.insert_user(sample_user());
        let issuer = issuer(store.clone(), StaticRenderer::failing());

        let issued = issuer.issue(&coin_payment("pi_9"), &user).await.unwrap();
        assert!(issued.document.is_err());
        assert!(store
            .find_receipt_by_number(&issued.receipt.receipt_number)
            .await
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_receipt_html_substitutions() {
        let store = Arc::new(InMemoryBillingStore::new());
        let issuer = issuer(store, StaticRenderer::ok());
        let user = sample_user();
        let receipt = Receipt {
            id: uuid::Uuid::new_v4(),
            receipt_number: "INV-2026-0042".into(),
            user_id: user.id,
            stripe_payment_intent_id: "pi_abc".into(),
            item_description: "E-Visit Pro License (1 Year) + 25 E-Token Bonus".into(),
            amount: 4999,
            currency: "eur".into(),
            issue_date: NaiveDate::from_ymd_opt(2026, 3, 4).unwrap(),
            delivered_at: None,
            delivery_attempts: 0,
            last_delivery_error: None,
            created_at: time::OffsetDateTime::now_utc(),
        };

        let html = issuer.render_html(&receipt, &user);
        assert!(html.contains("INV-2026-0042"));
        assert!(html.contains("04/03/2026"));
        assert!(html.contains("49,99 €"));
        assert!(html.contains("pi_abc"));
        assert!(html.contains("Card"));
        assert!(!html.contains("{{"));
    }
}
