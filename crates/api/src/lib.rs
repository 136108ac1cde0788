#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! E-Visit API Library
//!
//! HTTP surface for payments: the Stripe webhook endpoint, checkout and
//! portal sessions, receipts, and admin invoice/offer management.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
