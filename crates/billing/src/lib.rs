#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! E-Visit Billing
//!
//! Stripe webhook fulfillment, receipts and invoice/offer documents:
//! - Signed webhook verification and event routing
//! - Idempotent coin, license, renewal and cancellation handlers
//! - Sequentially numbered receipts, invoices and offers
//! - PDF rendering and emailed delivery
//! - Checkout, coin payments and the billing portal

pub mod checkout;
pub mod client;
pub mod delivery;
pub mod documents;
pub mod email;
pub mod error;
pub mod fulfillment;
pub mod gateway;
pub mod pdf;
pub mod purchase;
pub mod receipts;
pub mod sequence;
pub mod store;
pub mod webhooks;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::mpsc;

pub use checkout::{CheckoutService, CoinPackageRequest, CheckoutResponse, PaymentIntentResponse, PortalResponse};
pub use client::{PlanPrice, StripeClient, StripeConfig};
pub use delivery::{DeliveryJob, DeliveryQueue, DeliveryWorker, RedeliveryStats, DEFAULT_QUEUE_CAPACITY};
pub use documents::{Document, DocumentInput, DocumentKind, DocumentService, DocumentSummary, LineItemInput};
pub use email::{EmailConfig, Notifier, ResendNotifier};
pub use error::{BillingError, BillingResult, ErrorClass};
pub use fulfillment::{FulfillmentOutcome, FulfillmentService};
pub use gateway::{PaymentGateway, StripeGateway};
pub use pdf::{CompanyProfile, HttpPdfRenderer, PdfRenderer, TemplateSet};
pub use purchase::Purchase;
pub use receipts::ReceiptIssuer;
pub use store::{BillingStore, EventClaim, InMemoryBillingStore, PgBillingStore, PgDocumentRepository, Receipt};
pub use webhooks::{WebhookHandler, WebhookOutcome};

/// Everything the billing services are built from
pub struct BillingComponents {
    pub store: Arc<dyn BillingStore>,
    pub documents: Arc<dyn documents::DocumentRepository>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub renderer: Arc<dyn PdfRenderer>,
    pub notifier: Arc<dyn Notifier>,
    pub templates: Arc<TemplateSet>,
    pub company: CompanyProfile,
    pub config: StripeConfig,
    pub queue_capacity: usize,
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub store: Arc<dyn BillingStore>,
    pub webhooks: WebhookHandler,
    pub fulfillment: FulfillmentService,
    pub checkout: CheckoutService,
    pub receipts: ReceiptIssuer,
    pub documents: DocumentService,
    notifier: Arc<dyn Notifier>,
}

impl BillingService {
    /// Wire the services together. The returned receiver feeds a
    /// [`DeliveryWorker`] from [`BillingService::delivery_worker`].
    pub fn new(components: BillingComponents) -> (Self, mpsc::Receiver<DeliveryJob>) {
        let BillingComponents {
            store,
            documents,
            gateway,
            renderer,
            notifier,
            templates,
            company,
            config,
            queue_capacity,
        } = components;

        let (queue, receiver) = DeliveryQueue::channel(queue_capacity);

        let receipts = ReceiptIssuer::new(store.clone(), renderer.clone(), templates.clone(), company.clone());
        let fulfillment = FulfillmentService::new(
            store.clone(),
            gateway.clone(),
            receipts.clone(),
            queue,
            config.plans.clone(),
        );
        let webhooks = WebhookHandler::new(
            store.clone(),
            fulfillment.clone(),
            config.webhook_secret.clone(),
            config.webhook_tolerance,
        );
        let checkout = CheckoutService::new(
            store.clone(),
            gateway,
            config.plans.clone(),
            config.app_base_url.clone(),
        );
        let documents = DocumentService::new(documents, renderer, notifier.clone(), templates, company);

        (
            Self {
                store,
                webhooks,
                fulfillment,
                checkout,
                receipts,
                documents,
                notifier,
            },
            receiver,
        )
    }

    /// Postgres-backed service talking to Stripe, the PDF service and Resend
    pub fn from_pool(
        pool: PgPool,
        stripe: StripeClient,
        templates: TemplateSet,
    ) -> (Self, mpsc::Receiver<DeliveryJob>) {
        let config = stripe.config().clone();
        Self::new(BillingComponents {
            store: Arc::new(PgBillingStore::new(pool.clone())),
            documents: Arc::new(PgDocumentRepository::new(pool)),
            gateway: Arc::new(StripeGateway::new(stripe)),
            renderer: Arc::new(HttpPdfRenderer::from_env()),
            notifier: Arc::new(ResendNotifier::from_env()),
            templates: Arc::new(templates),
            company: CompanyProfile::from_env(),
            config,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        })
    }

    pub fn delivery_worker(&self) -> DeliveryWorker {
        DeliveryWorker::new(self.store.clone(), self.receipts.clone(), self.notifier.clone())
    }
}
