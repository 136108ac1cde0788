//! Best-effort receipt delivery
//!
//! Fulfillment only enqueues a job after the receipt is committed. The
//! worker renders and emails it off the request path. Failures are recorded
//! on the receipt row and picked up again by the redelivery sweep.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::email::{receipt_email, Notifier};
use crate::error::{BillingError, BillingResult};
use crate::receipts::ReceiptIssuer;
use crate::store::BillingStore;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryJob {
    Receipt { receipt_id: Uuid },
}

/// Sending half of the delivery channel
#[derive(Clone)]
pub struct DeliveryQueue {
    sender: mpsc::Sender<DeliveryJob>,
}

impl DeliveryQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DeliveryJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Never blocks. A full or closed queue is logged and left to the
    /// redelivery sweep.
    pub fn enqueue(&self, job: DeliveryJob) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!(job = ?job, "Delivery queue full - job left for redelivery sweep");
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                tracing::warn!(job = ?job, "Delivery queue closed - job left for redelivery sweep");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedeliveryStats {
    pub attempted: usize,
    pub delivered: usize,
}

#[derive(Clone)]
pub struct DeliveryWorker {
    store: Arc<dyn BillingStore>,
    issuer: ReceiptIssuer,
    notifier: Arc<dyn Notifier>,
}

impl DeliveryWorker {
    pub fn new(store: Arc<dyn BillingStore>, issuer: ReceiptIssuer, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            issuer,
            notifier,
        }
    }

    /// Render and email one receipt, then mark it delivered. Already
    /// delivered receipts are left alone.
    pub async fn deliver_receipt(&self, receipt_id: Uuid) -> BillingResult<()> {
        let receipt = self
            .store
            .find_receipt(receipt_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("receipt {}", receipt_id)))?;

        if receipt.delivered_at.is_some() {
            tracing::debug!(receipt_number = %receipt.receipt_number, "Receipt already delivered");
            return Ok(());
        }

        let user = self
            .store
            .find_user(receipt.user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", receipt.user_id)))?;

        let pdf = match self.issuer.render(&receipt, &user).await {
            Ok(pdf) => pdf,
            Err(e) => {
                self.store
                    .record_delivery_failure(receipt.id, &e.to_string())
                    .await?;
                return Err(e);
            }
        };

        let message = receipt_email(&receipt, &user, pdf, self.issuer.company());
        if !self.notifier.send(message).await? {
            let error = BillingError::Email(format!("receipt {} not accepted for delivery", receipt.receipt_number));
            self.store
                .record_delivery_failure(receipt.id, &error.to_string())
                .await?;
            return Err(error);
        }

        self.store.mark_receipt_delivered(receipt.id).await?;
        tracing::info!(
            receipt_number = %receipt.receipt_number,
            user_id = %user.id,
            "Receipt delivered"
        );
        Ok(())
    }

    pub async fn process(&self, job: DeliveryJob) {
        match job {
            DeliveryJob::Receipt { receipt_id } => {
                if let Err(e) = self.deliver_receipt(receipt_id).await {
                    tracing::error!(
                        receipt_id = %receipt_id,
                        error = %e,
                        "Receipt delivery failed - non-fatal, will be retried by sweep"
                    );
                }
            }
        }
    }

    /// Consume jobs until every sender is dropped
    pub async fn run(self, mut receiver: mpsc::Receiver<DeliveryJob>) {
        tracing::info!("Delivery worker started");
        while let Some(job) = receiver.recv().await {
            self.process(job).await;
        }
        tracing::info!("Delivery worker stopped");
    }

    /// Retry undelivered receipts below the attempt cap, oldest first
    pub async fn redeliver_pending(&self, limit: i64, max_attempts: i32) -> BillingResult<RedeliveryStats> {
        let pending = self.store.pending_receipts(limit, max_attempts).await?;
        let mut stats = RedeliveryStats {
            attempted: pending.len(),
            delivered: 0,
        };

        for receipt in pending {
            match self.deliver_receipt(receipt.id).await {
                Ok(()) => stats.delivered += 1,
                Err(e) => tracing::warn!(
                    receipt_number = %receipt.receipt_number,
                    attempts = receipt.delivery_attempts + 1,
                    error = %e,
                    "Receipt redelivery failed"
                ),
            }
        }

        Ok(stats)
    }
}
