//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Sequence not found: {0}")]
    SequenceNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Received renewal for unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    MalformedEvent(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("PDF rendering failed: {0}")]
    Render(String),

    #[error("Email delivery failed: {0}")]
    Email(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How an error should be surfaced and whether a retry can help
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller supplied bad data
    Validation,
    NotFound,
    /// Operation not legal in the current state
    InvalidState,
    /// Needs operator intervention, retrying will not help
    Fatal,
    /// Retry may succeed
    Transient,
}

impl BillingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) | Self::MalformedEvent(_) | Self::WebhookSignatureInvalid => {
                ErrorClass::Validation
            }
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::InvalidState(_) => ErrorClass::InvalidState,
            Self::SequenceNotFound(_) | Self::Config(_) | Self::UnknownSubscription(_) => {
                ErrorClass::Fatal
            }
            Self::StripeApi(_)
            | Self::Database(_)
            | Self::Render(_)
            | Self::Email(_)
            | Self::Internal(_) => ErrorClass::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Internal(format!("HTTP client error: {}", err))
    }
}

impl From<evisit_shared::DomainError> for BillingError {
    fn from(err: evisit_shared::DomainError) -> Self {
        BillingError::Validation(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            BillingError::SequenceNotFound("invoice".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            BillingError::UnknownSubscription("sub_1".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            BillingError::InvalidState("already sent".into()).class(),
            ErrorClass::InvalidState
        );
        assert!(BillingError::Database("connection reset".into()).is_retryable());
        assert!(!BillingError::Validation("missing recipient".into()).is_retryable());
    }

    #[test]
    fn test_renewal_message_names_subscription() {
        let err = BillingError::UnknownSubscription("sub_123".into());
        assert_eq!(
            err.to_string(),
            "Received renewal for unknown subscription: sub_123"
        );
    }
}
