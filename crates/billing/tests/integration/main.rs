//! Integration tests for the billing crate
//!
//! Webhook and document flows run against the in-memory store and the
//! fakes from `evisit_billing::testing`. Tests that need Postgres are
//! ignored by default.
//!
//! ## Running Tests
//! ```bash
//! cargo test -p evisit-billing --test integration
//! DATABASE_URL=postgres://... cargo test -p evisit-billing --test integration -- --ignored
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod documents;
mod support;
mod webhook_flow;
