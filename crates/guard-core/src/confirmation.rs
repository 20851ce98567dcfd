//! Propose/confirm primitive for dangerous operations.
//!
//! A dangerous operation is split in two: the caller is issued a
//! short-lived, single-use [`ConfirmationToken`], and the operation only
//! happens when the same user redeems it with an explicit acknowledgement
//! before it expires.
//!
//! ## Token lifecycle
//!
//! ```text
//! issue ──> Outstanding ──redeem(ack=true)──> Consumed (operation proceeds)
//!               │        ──redeem(ack=false)─> Consumed (NotAcknowledged)
//!               │        ──revoke───────────> Revoked
//!               └──── expires_at passes ────> Expired
//! ```
//!
//! Revoked, expired and unknown tokens all redeem as `Expired`; a second
//! redemption of a consumed token is `AlreadyConsumed`. Dead records are kept
//! for a grace period so late redemptions get an accurate answer, then purged.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use guard_common::UserId;

use crate::config::ConfirmationConfig;

/// Operations that require confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmOperation {
    /// Switch from paper trading to live trading with real capital.
    GoLive,
}

impl std::fmt::Display for ConfirmOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfirmOperation::GoLive => write!(f, "go_live"),
        }
    }
}

/// Single-use proof that a user was asked to confirm an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationToken {
    pub id: Uuid,
    pub operation: ConfirmOperation,
    #[serde(skip)]
    pub user_id: UserId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

impl ConfirmationToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Where a token record currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Outstanding,
    Expired,
    Consumed,
    Revoked,
    /// Never issued, already purged, or issued to someone else.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfirmError {
    #[error("confirmation token expired or unknown")]
    Expired,

    #[error("confirmation not acknowledged")]
    NotAcknowledged,

    #[error("confirmation token already consumed")]
    AlreadyConsumed,
}

#[derive(Debug, Clone)]
struct TokenRecord {
    token: ConfirmationToken,
    revoked: bool,
    /// When the record stopped being redeemable (consumed or revoked).
    closed_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    fn status_at(&self, now: DateTime<Utc>) -> TokenStatus {
        if self.token.consumed {
            TokenStatus::Consumed
        } else if self.revoked {
            TokenStatus::Revoked
        } else if self.token.is_expired_at(now) {
            TokenStatus::Expired
        } else {
            TokenStatus::Outstanding
        }
    }

    /// Instant after which the record can be dropped.
    fn dead_since(&self) -> DateTime<Utc> {
        self.closed_at.unwrap_or(self.token.expires_at)
    }
}

/// Issues and redeems confirmation tokens for all users.
#[derive(Debug)]
pub struct ConfirmationGateway {
    ttl: chrono::Duration,
    purge_grace: chrono::Duration,
    tokens: DashMap<Uuid, TokenRecord>,
}

impl ConfirmationGateway {
    pub fn new(config: &ConfirmationConfig) -> Self {
        Self::with_ttl(config.ttl, config.purge_grace)
    }

    pub fn with_ttl(ttl: Duration, purge_grace: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(60)),
            purge_grace: chrono::Duration::from_std(purge_grace)
                .unwrap_or(chrono::Duration::minutes(10)),
            tokens: DashMap::new(),
        }
    }

    pub fn issue(&self, user_id: &UserId, operation: ConfirmOperation) -> ConfirmationToken {
        self.issue_at(user_id, operation, Utc::now())
    }

    pub fn issue_at(
        &self,
        user_id: &UserId,
        operation: ConfirmOperation,
        now: DateTime<Utc>,
    ) -> ConfirmationToken {
        let token = ConfirmationToken {
            id: Uuid::new_v4(),
            operation,
            user_id: user_id.clone(),
            issued_at: now,
            expires_at: now + self.ttl,
            consumed: false,
        };
        self.tokens.insert(
            token.id,
            TokenRecord {
                token: token.clone(),
                revoked: false,
                closed_at: None,
            },
        );
        debug!(user_id = %user_id, token_id = %token.id, operation = %operation, "Confirmation token issued");
        token
    }

    /// Redeem a token. The token is consumed whether or not `ack` is set.
    pub fn redeem(
        &self,
        user_id: &UserId,
        token_id: Uuid,
        operation: ConfirmOperation,
        ack: bool,
    ) -> Result<ConfirmationToken, ConfirmError> {
        self.redeem_at(user_id, token_id, operation, ack, Utc::now())
    }

    pub fn redeem_at(
        &self,
        user_id: &UserId,
        token_id: Uuid,
        operation: ConfirmOperation,
        ack: bool,
        now: DateTime<Utc>,
    ) -> Result<ConfirmationToken, ConfirmError> {
        let mut record = match self.tokens.get_mut(&token_id) {
            Some(r) => r,
            None => return Err(ConfirmError::Expired),
        };
        if &record.token.user_id != user_id || record.token.operation != operation {
            return Err(ConfirmError::Expired);
        }

        match record.status_at(now) {
            TokenStatus::Consumed => Err(ConfirmError::AlreadyConsumed),
            TokenStatus::Revoked | TokenStatus::Expired | TokenStatus::Unknown => {
                Err(ConfirmError::Expired)
            }
            TokenStatus::Outstanding => {
                record.token.consumed = true;
                record.closed_at = Some(now);
                if ack {
                    info!(user_id = %user_id, token_id = %token_id, operation = %operation, "Confirmation accepted");
                    Ok(record.token.clone())
                } else {
                    info!(user_id = %user_id, token_id = %token_id, operation = %operation, "Confirmation declined");
                    Err(ConfirmError::NotAcknowledged)
                }
            }
        }
    }

    /// Make a token unredeemable. Returns `false` if it was not outstanding.
    pub fn revoke(&self, token_id: Uuid) -> bool {
        let now = Utc::now();
        match self.tokens.get_mut(&token_id) {
            Some(mut record) if record.status_at(now) == TokenStatus::Outstanding => {
                record.revoked = true;
                record.closed_at = Some(now);
                debug!(token_id = %token_id, "Confirmation token revoked");
                true
            }
            _ => false,
        }
    }

    /// Status of a token as seen by `user_id`.
    pub fn status(&self, user_id: &UserId, token_id: Uuid) -> TokenStatus {
        self.status_at(user_id, token_id, Utc::now())
    }

    pub fn status_at(&self, user_id: &UserId, token_id: Uuid, now: DateTime<Utc>) -> TokenStatus {
        match self.tokens.get(&token_id) {
            Some(record) if &record.token.user_id == user_id => record.status_at(now),
            _ => TokenStatus::Unknown,
        }
    }

    /// Drop records that have been dead for longer than the grace period.
    /// Returns the number of records removed.
    pub fn purge(&self, now: DateTime<Utc>) -> usize {
        let before = self.tokens.len();
        let grace = self.purge_grace;
        self.tokens
            .retain(|_, record| record.dead_since() + grace > now);
        let removed = before.saturating_sub(self.tokens.len());
        if removed > 0 {
            debug!(removed = removed, "Purged dead confirmation tokens");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
