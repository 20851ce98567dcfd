//! Shared types for the trading guard.
//!
//! CRITICAL: All percentages and balances use `rust_decimal::Decimal`.
//! NEVER use f64 for capital allocation math.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use clickhouse::Row;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Identifier of a dashboard user as reported by the identity service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Prediction-market venue a trading account is linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Polymarket,
    Kalshi,
}

impl Platform {
    /// All supported venues, in display order.
    pub const ALL: [Platform; 2] = [Platform::Polymarket, Platform::Kalshi];

    /// Returns the lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Polymarket => "polymarket",
            Platform::Kalshi => "kalshi",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "polymarket" | "poly" => Ok(Platform::Polymarket),
            "kalshi" => Ok(Platform::Kalshi),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

/// Venue environment of a linked account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Sandbox,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Sandbox => "sandbox",
            Environment::Production => "production",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sandbox" | "demo" => Ok(Environment::Sandbox),
            "production" | "prod" | "live" => Ok(Environment::Production),
            other => Err(format!("unknown environment: {other}")),
        }
    }
}

/// Allocation percentage helpers.
pub mod pct {
    use rust_decimal::Decimal;

    /// Number of fractional digits kept for allocation percentages.
    pub const SCALE: u32 = 2;

    /// Target sum of active allocations.
    pub const TOTAL: Decimal = Decimal::ONE_HUNDRED;

    /// Tolerance used when comparing a sum against [`TOTAL`] (0.01).
    pub const EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

    /// Returns true if `value` is within `[0, 100]` and has at most two fractional digits.
    pub fn is_valid(value: Decimal) -> bool {
        value >= Decimal::ZERO && value <= TOTAL && value.normalize().scale() <= SCALE
    }

    /// Returns true if `sum` is within [`EPSILON`] of [`TOTAL`].
    pub fn sums_to_total(sum: Decimal) -> bool {
        (sum - TOTAL).abs() <= EPSILON
    }
}

/// Journal row for a committed status event.
///
/// Payloads are stored as JSON text so the table does not need to track
/// every event variant.
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct StatusEventRow {
    /// Owning user.
    pub user_id: String,
    /// Per-user sequence number.
    pub seq: u64,
    /// Event type (e.g. "mode_changed").
    pub event_type: String,
    /// JSON-encoded payload.
    pub payload: String,
    /// Emission time in milliseconds since the epoch.
    pub emitted_at_ms: i64,
}

impl StatusEventRow {
    pub fn new(
        user_id: &UserId,
        seq: u64,
        event_type: impl Into<String>,
        payload: String,
        emitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            seq,
            event_type: event_type.into(),
            payload,
            emitted_at_ms: emitted_at.timestamp_millis(),
        }
    }
}

/// Balance reading for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceQuote {
    /// Available balance in the venue's settlement currency.
    pub amount: Decimal,
    /// When the balance was read.
    pub as_of: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_platform_round_trip_names() {
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
        assert_eq!("POLY".parse::<Platform>().unwrap(), Platform::Polymarket);
        assert!("binance".parse::<Platform>().is_err());
    }

    #[test]
    fn test_platform_serde_lowercase() {
        let json = serde_json::to_string(&Platform::Kalshi).unwrap();
        assert_eq!(json, "\"kalshi\"");
    }

    #[test]
    fn test_environment_parse() {
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("Sandbox".parse::<Environment>().unwrap(), Environment::Sandbox);
    }

    #[test]
    fn test_pct_validity() {
        assert!(pct::is_valid(dec!(0)));
        assert!(pct::is_valid(dec!(100)));
        assert!(pct::is_valid(dec!(33.33)));
        assert!(pct::is_valid(dec!(40.500)));
        assert!(!pct::is_valid(dec!(33.333)));
        assert!(!pct::is_valid(dec!(-0.01)));
        assert!(!pct::is_valid(dec!(100.01)));
    }

    #[test]
    fn test_pct_sums_to_total() {
        assert_eq!(pct::EPSILON, dec!(0.01));
        assert!(pct::sums_to_total(dec!(100)));
        assert!(pct::sums_to_total(dec!(99.99)));
        assert!(pct::sums_to_total(dec!(100.01)));
        assert!(!pct::sums_to_total(dec!(99.98)));
        assert!(!pct::sums_to_total(dec!(120)));
    }

    #[test]
    fn test_user_id_display() {
        let id = UserId::new("u-1");
        assert_eq!(id.to_string(), "u-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"u-1\"");
    }
}
