//! Email notifications for billing documents
//!
//! Sends receipts, invoices and offers via the Resend API.

use async_trait::async_trait;
use base64::Engine;
use evisit_shared::User;

use crate::documents::Document;
use crate::error::BillingResult;
use crate::pdf::{escape_html, format_eur_cents, CompanyProfile};
use crate::store::Receipt;

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
    /// Support email
    pub support_email: String,
    /// Resend endpoint, overridable for tests
    pub api_url: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "E-Visit <noreply@e-visiton.com>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "E-Visit".to_string()),
            support_email: std::env::var("SUPPORT_EMAIL")
                .unwrap_or_else(|_| "support@e-visiton.com".to_string()),
            api_url: "https://api.resend.com/emails".to_string(),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
}

/// A message ready to hand to a [`Notifier`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns `Ok(false)` when delivery failed; callers decide whether
    /// that matters. `Err` is reserved for configuration problems.
    async fn send(&self, message: OutboundEmail) -> BillingResult<bool>;
}

/// [`Notifier`] backed by the Resend API
#[derive(Clone)]
pub struct ResendNotifier {
    config: EmailConfig,
    client: reqwest::Client,
}

impl ResendNotifier {
    /// Create a new email service
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn send(&self, message: OutboundEmail) -> BillingResult<bool> {
        let OutboundEmail {
            to,
            subject,
            html,
            attachments,
        } = message;

        if !self.config.is_enabled() {
            tracing::warn!(
                to = %to,
                subject = %subject,
                "Email not configured, skipping"
            );
            return Ok(false);
        }

        let attachments: Vec<serde_json::Value> = attachments
            .iter()
            .map(|a| {
                serde_json::json!({
                    "filename": a.filename,
                    "content": base64::engine::general_purpose::STANDARD.encode(&a.content),
                })
            })
            .collect();

        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [to],
            "subject": subject,
            "html": html,
            "attachments": attachments,
        });

        let response = self
            .client
            .post(&self.config.api_url)
            .header(
                "Authorization",
                format!("Bearer {}", self.config.resend_api_key),
            )
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(to = %to, subject = %subject, "Billing email sent");
                Ok(true)
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    status = %status,
                    body = %body,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false)
            }
            Err(e) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    error = %e,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false)
            }
        }
    }
}

/// Receipt mail with the rendered PDF attached
pub fn receipt_email(receipt: &Receipt, user: &User, pdf: Vec<u8>, company: &CompanyProfile) -> OutboundEmail {
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2>Thank you for your purchase</h2>
    <p>Hi {name},</p>
    <p>We received your payment of <strong>{amount}</strong> for <strong>{item}</strong>.</p>
    <p>Your receipt <strong>{number}</strong> is attached to this email.</p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{company} &middot; {company_email}</p>
</body>
</html>"#,
        name = escape_html(&user.name),
        amount = format_eur_cents(receipt.amount),
        item = escape_html(&receipt.item_description),
        number = receipt.receipt_number,
        company = escape_html(&company.name),
        company_email = escape_html(&company.email),
    );

    OutboundEmail {
        to: user.email.clone(),
        subject: format!("Your E-Visit Receipt [{}]", receipt.receipt_number),
        html,
        attachments: vec![Attachment {
            filename: format!("receipt-{}.pdf", receipt.receipt_number),
            content: pdf,
        }],
    }
}

/// Invoice or offer mail for the document recipient
pub fn document_email(document: &Document, pdf: Vec<u8>, company: &CompanyProfile) -> OutboundEmail {
    let label = document.kind.label();
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <p>Dear {recipient},</p>
    <p>Please find attached our {label_lower} <strong>{number}</strong> from {company}.</p>
    <p>If you have any questions, reply to this email or contact <a href="mailto:{company_email}">{company_email}</a>.</p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{company}</p>
</body>
</html>"#,
        recipient = escape_html(&document.recipient_name),
        label_lower = label.to_lowercase(),
        number = document.number,
        company = escape_html(&company.name),
        company_email = escape_html(&company.email),
    );

    OutboundEmail {
        to: document.recipient_email.clone(),
        subject: format!("{} [{}] from E-Visit", label, document.number),
        html,
        attachments: vec![Attachment {
            filename: format!("{}-{}.pdf", document.kind, document.number),
            content: pdf,
        }],
    }
}
