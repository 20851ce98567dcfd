//! Shared types and utilities for the trading guard.
//!
//! This crate contains:
//! - Common types (UserId, Platform, Environment, allocation percentage helpers)
//! - ClickHouse client wrapper used as the status event journal
//! - Schema definitions

pub mod clickhouse;
pub mod types;

pub use clickhouse::{ClickHouseClient, ClickHouseConfig, ClickHouseError};
pub use types::*;
