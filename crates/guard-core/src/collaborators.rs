//! External collaborator interfaces.
//!
//! The guard never talks to identity storage, credential storage, venue
//! balance APIs or the execution engine directly. Each is reached through one
//! of the traits below:
//!
//! - `IdentityProvider`: session token validation and onboarding progress
//! - `CredentialVault`: write-only secret storage plus connection tests
//! - `BalanceProvider`: one per platform, balance lookup per account
//! - `ExecutionSink`: receives `mode_changed` events (halt/flatten on kill)
//! - `EventJournal`: durable audit trail of committed status events
//!
//! ## Implementations
//!
//! - `memory`: in-process implementations used by tests and local runs
//! - `http`: JSON-over-HTTP clients for the deployed collaborators

pub mod http;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use guard_common::{Platform, UserId};

use crate::broadcast::StatusEvent;
use crate::retry::Retryable;

/// Errors returned by any collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider rejected request: {0}")]
    Rejected(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl Retryable for ProviderError {
    fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_) | ProviderError::Timeout(_))
    }
}

/// Opaque handle to a stored credential. The secret itself is never returned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRef(String);

impl CredentialRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// What the identity service knows about a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub user_id: UserId,
    /// Server-side onboarding step (0..=5).
    pub onboarding_step: u8,
    pub onboarding_completed: bool,
    /// Identifier of the session the token belongs to.
    pub token_id: String,
}

/// Identity lookup failures.
///
/// The distinction between variants is kept for logging only; the session gate
/// collapses all token problems into one client-facing error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("token invalid")]
    Invalid,

    #[error("token revoked")]
    Revoked,

    #[error("token expired")]
    Expired,

    #[error("token malformed")]
    Malformed,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl Retryable for IdentityError {
    fn is_transient(&self) -> bool {
        match self {
            IdentityError::Provider(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a session token. Must reflect server-side changes immediately.
    async fn validate(&self, token: &str) -> Result<IdentityRecord, IdentityError>;

    /// Record that `user_id` finished onboarding step `step`.
    async fn record_onboarding_step(
        &self,
        user_id: &UserId,
        step: u8,
    ) -> Result<IdentityRecord, IdentityError>;
}

#[async_trait]
pub trait CredentialVault: Send + Sync {
    /// Store a venue secret for `account_id`. Not idempotent from our side; never retried.
    async fn store(&self, account_id: Uuid, secret: &str) -> Result<CredentialRef, ProviderError>;

    /// Check that the stored credential can reach the venue.
    async fn test_connection(&self, account_id: Uuid) -> Result<bool, ProviderError>;
}

#[async_trait]
pub trait BalanceProvider: Send + Sync {
    /// Venue served by this provider.
    fn platform(&self) -> Platform;

    async fn get_balance(&self, account_id: Uuid) -> Result<Decimal, ProviderError>;
}

#[async_trait]
pub trait ExecutionSink: Send + Sync {
    /// Deliver a `mode_changed` event. `Ok` means the execution engine acknowledged it.
    ///
    /// Deliveries may repeat; receivers de-duplicate by `(user_id, seq)`.
    async fn deliver(&self, event: &StatusEvent) -> Result<(), ProviderError>;
}

#[async_trait]
pub trait EventJournal: Send + Sync {
    /// Durably append a batch of committed events.
    async fn append(&self, events: &[StatusEvent]) -> Result<(), ProviderError>;
}
