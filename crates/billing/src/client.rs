//! Stripe client configuration

use std::time::Duration;

use evisit_shared::PlanType;
use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Default signature timestamp tolerance (5 minutes)
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Maximum age of a signed webhook timestamp
    pub webhook_tolerance: Duration,
    /// License plans sold through checkout, keyed by price ID
    pub plans: Vec<PlanPrice>,
    /// Base URL for success/cancel redirects
    pub app_base_url: String,
}

/// A Stripe price mapped to a license plan and its coin bonus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanPrice {
    pub price_id: String,
    pub plan: PlanType,
    pub bonus_coins: i64,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let mut plans = vec![
            PlanPrice {
                price_id: required("STRIPE_PRICE_MONTHLY")?,
                plan: PlanType::Monthly,
                bonus_coins: 5,
            },
            PlanPrice {
                price_id: required("STRIPE_PRICE_SIX_MONTH")?,
                plan: PlanType::SixMonth,
                bonus_coins: 10,
            },
            PlanPrice {
                price_id: required("STRIPE_PRICE_YEARLY")?,
                plan: PlanType::Yearly,
                bonus_coins: 25,
            },
        ];
        if let Ok(price_id) = std::env::var("STRIPE_PRICE_ONE_TIME") {
            plans.push(PlanPrice {
                price_id,
                plan: PlanType::OneTime,
                bonus_coins: 20,
            });
        }

        let tolerance_secs = std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_WEBHOOK_TOLERANCE_SECS);

        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            webhook_tolerance: Duration::from_secs(tolerance_secs),
            plans,
            app_base_url: std::env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }

    /// Look up the plan sold under a price ID
    pub fn plan_for_price(&self, price_id: &str) -> Option<&PlanPrice> {
        self.plans.iter().find(|p| p.price_id == price_id)
    }
}

fn required(key: &'static str) -> BillingResult<String> {
    std::env::var(key).map_err(|_| BillingError::Config(format!("{} not set", key)))
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
