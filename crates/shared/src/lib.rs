//! usagebill shared types and utilities
//!
//! Domain types shared by the billing engine and the worker: identifiers,
//! lifecycle enums, usage events, invoices, subscriptions and the Postgres
//! pool helpers.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod db;
pub mod error;
pub mod metadata;
pub mod types;

pub use db::*;
pub use error::*;
pub use metadata::EventMetadata;
pub use types::*;
