#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! E-Visit Background Worker
//!
//! Handles scheduled jobs:
//! - Receipt redelivery sweep (every 10 minutes)
//! - Webhook event record retention (daily at 3:30 AM UTC)

mod jobs;

use std::sync::Arc;

use evisit_billing::{
    BillingStore, CompanyProfile, DeliveryWorker, HttpPdfRenderer, PgBillingStore, ReceiptIssuer,
    ResendNotifier, TemplateSet,
};
use evisit_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::jobs::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting E-Visit Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url, 5).await?;
    info!("Database pool created");

    let config = Arc::new(WorkerConfig::from_env());
    info!(config = ?config, "Worker configuration loaded");

    let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool));
    let issuer = ReceiptIssuer::new(
        store.clone(),
        Arc::new(HttpPdfRenderer::from_env()),
        Arc::new(TemplateSet::from_env()?),
        CompanyProfile::from_env(),
    );
    let delivery = DeliveryWorker::new(store.clone(), issuer, Arc::new(ResendNotifier::from_env()));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Receipt redelivery sweep
    let sweep_worker = delivery.clone();
    let sweep_config = config.clone();
    scheduler
        .add(Job::new_async("0 */10 * * * *", move |_uuid, _l| {
            let worker = sweep_worker.clone();
            let config = sweep_config.clone();
            Box::pin(async move {
                jobs::redeliver_receipts(&worker, &config).await;
            })
        })?)
        .await?;
    info!("Scheduled: Receipt redelivery sweep (every 10 minutes)");

    // Job 2: Webhook event retention
    let retention_store = store.clone();
    let retention_config = config.clone();
    scheduler
        .add(Job::new_async("0 30 3 * * *", move |_uuid, _l| {
            let store = retention_store.clone();
            let config = retention_config.clone();
            Box::pin(async move {
                jobs::purge_webhook_events(store.as_ref(), &config).await;
            })
        })?)
        .await?;
    info!("Scheduled: Webhook event retention (daily 3:30 UTC)");

    scheduler.start().await?;
    info!("Worker scheduler started");

    // Catch up on anything left undelivered while the worker was down
    jobs::redeliver_receipts(&delivery, &config).await;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down worker");

    Ok(())
}
