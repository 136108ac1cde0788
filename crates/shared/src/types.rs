//! Common types used across E-Visit

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::DomainError;

// =============================================================================
// Enums
// =============================================================================

/// Account role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    Consumer,
    Business,
    Admin,
}

impl UserRole {
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Consumer => write!(f, "consumer"),
            Self::Business => write!(f, "business"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "consumer" => Ok(Self::Consumer),
            "business" => Ok(Self::Business),
            "admin" => Ok(Self::Admin),
            _ => Err(DomainError::unknown("user role", s)),
        }
    }
}

/// License plan purchased through checkout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum PlanType {
    Monthly,
    SixMonth,
    Yearly,
    OneTime,
}

impl PlanType {
    /// Human readable term, used on receipts
    pub fn label(&self) -> &'static str {
        match self {
            Self::Monthly => "1 Month",
            Self::SixMonth => "6 Months",
            Self::Yearly => "1 Year",
            Self::OneTime => "One-Time",
        }
    }

    /// One-time licenses have no external subscription behind them
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::OneTime)
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monthly => write!(f, "monthly"),
            Self::SixMonth => write!(f, "six-month"),
            Self::Yearly => write!(f, "yearly"),
            Self::OneTime => write!(f, "one-time"),
        }
    }
}

impl std::str::FromStr for PlanType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "monthly" => Ok(Self::Monthly),
            "six-month" | "six_month" | "sixmonth" => Ok(Self::SixMonth),
            "yearly" | "annual" => Ok(Self::Yearly),
            "one-time" | "one_time" | "onetime" => Ok(Self::OneTime),
            _ => Err(DomainError::unknown("plan type", s)),
        }
    }
}

/// License lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    Active,
    Canceled,
    PastDue,
}

impl std::fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Canceled => write!(f, "canceled"),
            Self::PastDue => write!(f, "past_due"),
        }
    }
}

impl std::str::FromStr for LicenseStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "past_due" => Ok(Self::PastDue),
            _ => Err(DomainError::unknown("license status", s)),
        }
    }
}

/// Status of an invoice or offer
///
/// Invoices move draft -> sent -> {paid | cancelled}, offers move
/// draft -> sent -> {accepted | declined}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    #[default]
    Draft,
    Sent,
    Paid,
    Accepted,
    Declined,
    Cancelled,
}

impl DocumentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Draft | Self::Sent)
    }

    /// Capitalised form printed on documents
    pub fn title(&self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::Sent => "Sent",
            Self::Paid => "Paid",
            Self::Accepted => "Accepted",
            Self::Declined => "Declined",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Sent => write!(f, "sent"),
            Self::Paid => write!(f, "paid"),
            Self::Accepted => write!(f, "accepted"),
            Self::Declined => write!(f, "declined"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for DocumentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "sent" => Ok(Self::Sent),
            "paid" => Ok(Self::Paid),
            "accepted" => Ok(Self::Accepted),
            "declined" => Ok(Self::Declined),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(DomainError::unknown("document status", s)),
        }
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Platform user, also the billing anchor for coins and licenses
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub surname: String,
    pub email: String,
    pub role: UserRole,
    pub is_verified: bool,
    pub coin_balance: i64,
    pub stripe_customer_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.name, self.surname).trim().to_string()
    }
}

/// Entitlement created by a subscription or one-time license purchase
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct License {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stripe_subscription_id: Option<String>,
    pub plan_type: PlanType,
    pub subscription_status: LicenseStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    /// Checkout session or invoice that created the license
    pub stripe_session_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl License {
    pub fn is_active(&self) -> bool {
        self.subscription_status == LicenseStatus::Active
    }
}
