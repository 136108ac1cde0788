//! Application state

use std::sync::Arc;

use evisit_billing::BillingService;
use sqlx::PgPool;

use crate::{auth::JwtManager, config::Config};

/// Access tokens are issued by the account service; this only bounds tokens minted locally
const ACCESS_TOKEN_EXPIRY_HOURS: i64 = 24;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub jwt: JwtManager,
    /// Billing service, absent when billing is disabled
    pub billing: Option<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing: Option<BillingService>) -> Self {
        let jwt = JwtManager::new(&config.jwt_secret, ACCESS_TOKEN_EXPIRY_HOURS);
        Self {
            pool,
            config: Arc::new(config),
            jwt,
            billing,
        }
    }
}
