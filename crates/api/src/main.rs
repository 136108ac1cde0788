//! E-Visit API Server
//!
//! Serves the Stripe webhook, payment initiation, receipts and admin
//! invoice/offer routes.

use std::net::SocketAddr;

use axum::http::{header, HeaderValue, Method};
use evisit_api::{create_router, AppState, Config};
use evisit_billing::{BillingService, StripeClient, TemplateSet};
use evisit_shared::{create_pool, run_migrations};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,evisit_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting E-Visit API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    tracing::info!("Database connection established");

    if config.run_migrations {
        tracing::info!("Running database migrations...");
        run_migrations(&pool).await?;
    } else {
        tracing::info!("Database migrations skipped");
    }

    // A missing template or Stripe key is fatal when billing is enabled
    let billing = if config.enable_billing {
        let templates = TemplateSet::load(&config.template_dir)?;
        let stripe = StripeClient::from_env()?;
        let (billing, receipts) = BillingService::from_pool(pool.clone(), stripe, templates);

        tokio::spawn(billing.delivery_worker().run(receipts));
        tracing::info!("Receipt delivery worker started");
        Some(billing)
    } else {
        tracing::warn!("Billing disabled: webhook and payment routes are not mounted");
        None
    };

    let allowed_origins: Vec<HeaderValue> = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| config.frontend_url.clone())
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    tracing::info!(allowed_origins = ?allowed_origins, "CORS configured");

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([header::CONTENT_DISPOSITION]);

    let addr: SocketAddr = config.bind_address.parse()?;
    let state = AppState::new(pool, config, billing);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
