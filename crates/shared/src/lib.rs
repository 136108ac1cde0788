#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! E-Visit Shared Types and Utilities
//!
//! This crate contains types, errors, and utilities shared across the E-Visit platform.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
