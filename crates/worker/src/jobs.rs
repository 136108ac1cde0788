//! Scheduled billing maintenance jobs

use std::env;

use evisit_billing::{BillingStore, DeliveryWorker};
use tracing::{error, info};

/// Worker settings loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Receipts retried per sweep
    pub redelivery_batch: i64,
    /// Receipts with this many failed attempts are left for an operator
    pub max_delivery_attempts: i32,
    pub webhook_event_retention_days: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redelivery_batch: 50,
            max_delivery_attempts: 5,
            webhook_event_retention_days: 30,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redelivery_batch: parse_or("RECEIPT_REDELIVERY_BATCH", defaults.redelivery_batch),
            max_delivery_attempts: parse_or(
                "RECEIPT_MAX_DELIVERY_ATTEMPTS",
                defaults.max_delivery_attempts,
            ),
            webhook_event_retention_days: parse_or(
                "WEBHOOK_EVENT_RETENTION_DAYS",
                defaults.webhook_event_retention_days,
            ),
        }
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Retry receipts whose delivery failed or never happened
pub async fn redeliver_receipts(worker: &DeliveryWorker, config: &WorkerConfig) {
    match worker
        .redeliver_pending(config.redelivery_batch, config.max_delivery_attempts)
        .await
    {
        Ok(stats) if stats.attempted == 0 => {}
        Ok(stats) => info!(
            attempted = stats.attempted,
            delivered = stats.delivered,
            "Receipt redelivery sweep complete"
        ),
        Err(e) => error!(error = %e, "Receipt redelivery sweep failed"),
    }
}

/// Drop processed webhook event records past the retention window
pub async fn purge_webhook_events(store: &dyn BillingStore, config: &WorkerConfig) {
    match store
        .purge_webhook_events(config.webhook_event_retention_days)
        .await
    {
        Ok(purged) => info!(
            purged = purged,
            retention_days = config.webhook_event_retention_days,
            "Webhook event records purged"
        ),
        Err(e) => error!(error = %e, "Failed to purge webhook event records"),
    }
}
