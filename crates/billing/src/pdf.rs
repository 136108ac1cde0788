//! HTML to PDF rendering
//!
//! Rendering is delegated to an external conversion service. This module
//! owns the templates, the placeholder substitution and number/date
//! formatting for documents and receipts.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{BillingError, BillingResult};

#[async_trait]
pub trait PdfRenderer: Send + Sync {
    /// Convert populated HTML into PDF bytes. An empty result is an error.
    async fn render(&self, html: &str) -> BillingResult<Vec<u8>>;
}

/// Renderer configuration
#[derive(Debug, Clone)]
pub struct PdfConfig {
    /// Base URL of a Gotenberg-compatible conversion service
    pub service_url: String,
    pub timeout: Duration,
}

impl PdfConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            service_url: std::env::var("PDF_RENDERER_URL")
                .unwrap_or_else(|_| "http://localhost:3001".to_string()),
            timeout: Duration::from_secs(
                std::env::var("PDF_RENDER_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}

/// [`PdfRenderer`] that posts the HTML as `index.html` to the conversion service
#[derive(Clone)]
pub struct HttpPdfRenderer {
    config: PdfConfig,
    client: reqwest::Client,
}

impl HttpPdfRenderer {
    pub fn new(config: PdfConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(PdfConfig::from_env())
    }
}

#[async_trait]
impl PdfRenderer for HttpPdfRenderer {
    async fn render(&self, html: &str) -> BillingResult<Vec<u8>> {
        let part = reqwest::multipart::Part::text(html.to_string())
            .file_name("index.html")
            .mime_str("text/html")
            .map_err(|e| BillingError::Render(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("files", part);

        let url = format!(
            "{}/forms/chromium/convert/html",
            self.config.service_url.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .timeout(self.config.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| BillingError::Render(format!("PDF service unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "PDF service rejected document");
            return Err(BillingError::Render(format!("PDF service returned {}", status)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| BillingError::Render(e.to_string()))?;

        if bytes.is_empty() {
            return Err(BillingError::Render("PDF service returned an empty document".into()));
        }

        Ok(bytes.to_vec())
    }
}

/// HTML templates for every rendered document
#[derive(Debug, Clone)]
pub struct TemplateSet {
    pub invoice: String,
    pub offer: String,
    pub receipt: String,
}

impl TemplateSet {
    /// Load `invoice.html`, `offer.html` and `receipt.html` from a directory.
    /// A missing template is a configuration error.
    pub fn load(dir: impl AsRef<Path>) -> BillingResult<Self> {
        let dir = dir.as_ref();
        let read = |name: &str| {
            let path = dir.join(name);
            std::fs::read_to_string(&path).map_err(|e| {
                tracing::error!(path = %path.display(), error = %e, "Template missing");
                BillingError::Config(format!("Template {} not readable: {}", path.display(), e))
            })
        };

        Ok(Self {
            invoice: read("invoice.html")?,
            offer: read("offer.html")?,
            receipt: read("receipt.html")?,
        })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::load(std::env::var("TEMPLATE_DIR").unwrap_or_else(|_| "templates".to_string()))
    }
}

/// Issuer identity printed on every document
#[derive(Debug, Clone)]
pub struct CompanyProfile {
    pub name: String,
    pub address: String,
    pub email: String,
    pub logo_url: String,
}

impl CompanyProfile {
    pub fn from_env() -> Self {
        Self {
            name: std::env::var("COMPANY_NAME").unwrap_or_else(|_| "E-Visiton.".to_string()),
            address: std::env::var("COMPANY_ADDRESS")
                .unwrap_or_else(|_| "Kaçanik, Kosovo".to_string()),
            email: std::env::var("COMPANY_EMAIL")
                .unwrap_or_else(|_| "info@e-visiton.com".to_string()),
            logo_url: std::env::var("COMPANY_LOGO_URL").unwrap_or_default(),
        }
    }

    pub fn template_values(&self) -> Vec<(&'static str, String)> {
        vec![
            ("company_name", escape_html(&self.name)),
            ("company_address", escape_html(&self.address)),
            ("company_email", escape_html(&self.email)),
            ("logo_url", escape_html(&self.logo_url)),
        ]
    }
}

/// Replace every `{{key}}` with its value in a single pass over the
/// template. Substituted values are never scanned again. Unknown
/// placeholders stay as-is.
pub fn render_template(template: &str, values: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = &after[..end];
        match values.iter().find(|(k, _)| *k == key) {
            Some((_, value)) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Group the integer part of a non-negative amount string
fn group_thousands(digits: &str, separator: char) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(separator);
        }
        out.push(c);
    }
    out
}

/// Split into (negative, integer digits, two-digit fraction)
fn split_amount(amount: Decimal) -> (bool, String, String) {
    let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let mut abs = rounded.abs();
    abs.rescale(2);
    let text = abs.to_string();
    let (int, frac) = text.split_once('.').unwrap_or((text.as_str(), "00"));
    (rounded.is_sign_negative() && !rounded.is_zero(), int.to_string(), frac.to_string())
}

/// `$1,234.50`
pub fn format_usd(amount: Decimal) -> String {
    let (negative, int, frac) = split_amount(amount);
    format!(
        "{}${}.{}",
        if negative { "-" } else { "" },
        group_thousands(&int, ','),
        frac
    )
}

/// `1.234,50 €` from minor units
pub fn format_eur_cents(cents: i64) -> String {
    let (negative, int, frac) = split_amount(Decimal::new(cents, 2));
    format!(
        "{}{},{} €",
        if negative { "-" } else { "" },
        group_thousands(&int, '.'),
        frac
    )
}

/// `October 18, 2026`
pub fn format_long_date(date: NaiveDate) -> String {
    date.format("%B %-d, %Y").to_string()
}

/// `18/10/2026`
pub fn format_day_month_year(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}
