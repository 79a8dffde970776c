//! HTTP service for `OrderCore`.
//!
//! Exposes order placement plus the product and user maintenance routes it
//! depends on, over either the in-memory or the PostgreSQL store.

#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod telemetry;

pub use api::{router, AppState};
pub use config::{AppConfig, Backend, ConfigError};
