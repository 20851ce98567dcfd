//! Authentication and onboarding gate.
//!
//! Every request is resolved against the identity collaborator; nothing is
//! trusted from a previous call because onboarding can be completed
//! server-side (for example by an administrator) at any time. The last seen
//! summary per user is cached only to build snapshots and to detect changes
//! worth pushing to observers.
//!
//! The one exception is the emergency stop. Recently validated sessions are
//! remembered by token digest, and [`SessionGate::validate_or_recent`] falls
//! back to them while the identity service is unreachable.
//!
//! ## Access states
//!
//! | Identity result             | State                        | Protected route      |
//! |-----------------------------|------------------------------|----------------------|
//! | no/invalid/revoked token    | `Unauthenticated`            | `RedirectLogin`      |
//! | step < 5                    | `OnboardingIncomplete(step)` | `RedirectOnboarding` |
//! | step 5                      | `Active`                     | `Allow`              |

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;
use tracing::{debug, info, warn};

use guard_common::UserId;

use crate::broadcast::{StatusBroadcaster, StatusPayload};
use crate::collaborators::{IdentityError, IdentityProvider, IdentityRecord};
use crate::error::ErrorKind;
use crate::retry::{retry_idempotent, RetryPolicy};

/// Last onboarding step; reaching it makes the user `Active`.
pub const ONBOARDING_FINAL_STEP: u8 = 5;

/// A validated session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: UserId,
    pub onboarding_step: u8,
    pub onboarding_completed: bool,
    pub token_id: String,
    pub validated_at: DateTime<Utc>,
}

impl Session {
    fn from_record(record: IdentityRecord) -> Self {
        Self {
            user_id: record.user_id,
            onboarding_step: record.onboarding_step.min(ONBOARDING_FINAL_STEP),
            onboarding_completed: record.onboarding_completed,
            token_id: record.token_id,
            validated_at: Utc::now(),
        }
    }

    pub fn access(&self) -> AccessState {
        if self.onboarding_step >= ONBOARDING_FINAL_STEP {
            AccessState::Active
        } else {
            AccessState::OnboardingIncomplete {
                step: self.onboarding_step,
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.access() == AccessState::Active
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            user_id: self.user_id.clone(),
            onboarding_step: self.onboarding_step,
            onboarding_completed: self.onboarding_completed,
        }
    }
}

/// The part of a session that observers see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub user_id: UserId,
    pub onboarding_step: u8,
    pub onboarding_completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AccessState {
    Unauthenticated,
    OnboardingIncomplete { step: u8 },
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Allow,
    RedirectOnboarding { step: u8 },
    RedirectLogin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Reachable without a session.
    Public,
    /// Onboarding wizard: any authenticated user.
    Onboarding,
    /// Everything else: onboarding must be complete.
    Protected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Missing, malformed, expired or revoked. Deliberately not more specific.
    #[error("invalid or expired session")]
    Invalid,

    #[error("identity service unavailable")]
    Unavailable,
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Invalid => ErrorKind::Auth,
            AuthError::Unavailable => ErrorKind::ExternalProvider,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OnboardingError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("onboarding step {0} does not exist (expected 1..={max})", max = ONBOARDING_FINAL_STEP)]
    StepOutOfRange(u8),

    #[error("cannot complete step {requested} while at step {current}")]
    StepOutOfOrder { current: u8, requested: u8 },

    #[error("identity service rejected the update: {0}")]
    Provider(String),
}

impl OnboardingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OnboardingError::Auth(e) => e.kind(),
            OnboardingError::StepOutOfRange(_) | OnboardingError::StepOutOfOrder { .. } => {
                ErrorKind::Validation
            }
            OnboardingError::Provider(_) => ErrorKind::ExternalProvider,
        }
    }
}

fn auth_error(e: IdentityError) -> AuthError {
    match e {
        IdentityError::Provider(_) => AuthError::Unavailable,
        IdentityError::Invalid
        | IdentityError::Revoked
        | IdentityError::Expired
        | IdentityError::Malformed => AuthError::Invalid,
    }
}

type TokenDigest = [u8; 32];

fn token_digest(token: &str) -> TokenDigest {
    Keccak256::digest(token.as_bytes()).into()
}

struct RecentSession {
    session: Session,
    expires_at: Instant,
}

pub struct SessionGate {
    identity: Arc<dyn IdentityProvider>,
    broadcaster: StatusBroadcaster,
    retry: RetryPolicy,
    summaries: DashMap<UserId, SessionSummary>,
    recent: DashMap<TokenDigest, RecentSession>,
    recent_ttl: Duration,
}

impl SessionGate {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        broadcaster: StatusBroadcaster,
        retry: RetryPolicy,
        recent_ttl: Duration,
    ) -> Self {
        Self {
            identity,
            broadcaster,
            retry,
            summaries: DashMap::new(),
            recent: DashMap::new(),
            recent_ttl,
        }
    }

    /// Resolve `token` against the identity service.
    pub async fn validate(&self, token: &str) -> Result<Session, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Invalid);
        }

        let identity = Arc::clone(&self.identity);
        let record = retry_idempotent(self.retry, "identity.validate", || {
            let identity = Arc::clone(&identity);
            async move { identity.validate(token).await }
        })
        .await
        .map_err(|e| {
            // Keep the exact reason in logs only.
            debug!(reason = %e, "Session validation failed");
            if let IdentityError::Provider(ref p) = e {
                warn!(error = %p, "Identity service error during validation");
            }
            auth_error(e)
        });

        let session = match record {
            Ok(record) => Session::from_record(record),
            Err(e) => {
                if e == AuthError::Invalid {
                    self.recent.remove(&token_digest(token));
                }
                return Err(e);
            }
        };
        self.remember(&session);
        self.recent.insert(
            token_digest(token),
            RecentSession {
                session: session.clone(),
                expires_at: Instant::now() + self.recent_ttl,
            },
        );
        Ok(session)
    }

    /// Like [`validate`](Self::validate), but while the identity service is
    /// unavailable a session validated within the cache ttl is accepted.
    ///
    /// Only the emergency stop should use this.
    pub async fn validate_or_recent(&self, token: &str) -> Result<Session, AuthError> {
        match self.validate(token).await {
            Err(AuthError::Unavailable) => {
                let session = self.recent_session(token.trim()).ok_or(AuthError::Unavailable)?;
                warn!(
                    user_id = %session.user_id,
                    validated_at = %session.validated_at,
                    "Identity service unavailable, accepting recently validated session"
                );
                Ok(session)
            }
            other => other,
        }
    }

    fn recent_session(&self, token: &str) -> Option<Session> {
        let entry = self.recent.get(&token_digest(token))?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.session.clone())
    }

    /// Drop remembered sessions past their ttl. Returns how many were dropped.
    pub fn purge_recent(&self) -> usize {
        let now = Instant::now();
        let before = self.recent.len();
        self.recent.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.recent.len())
    }

    /// Record the summary and push a `session_changed` event if it moved.
    fn remember(&self, session: &Session) {
        let summary = session.summary();
        let previous = self.summaries.insert(session.user_id.clone(), summary.clone());
        if let Some(previous) = previous {
            if previous != summary {
                info!(
                    user_id = %session.user_id,
                    from_step = previous.onboarding_step,
                    to_step = summary.onboarding_step,
                    "Session state changed"
                );
                self.broadcaster
                    .publish(&session.user_id, StatusPayload::SessionChanged(summary));
            }
        }
    }

    /// Decision for a protected route.
    pub fn gate(&self, session: Option<&Session>) -> GateDecision {
        match session.map(Session::access) {
            None | Some(AccessState::Unauthenticated) => GateDecision::RedirectLogin,
            Some(AccessState::OnboardingIncomplete { step }) => {
                GateDecision::RedirectOnboarding { step }
            }
            Some(AccessState::Active) => GateDecision::Allow,
        }
    }

    /// Decision for a route of the given kind.
    pub fn admit(&self, session: Option<&Session>, route: RouteKind) -> GateDecision {
        match (route, session) {
            (RouteKind::Public, _) => GateDecision::Allow,
            (RouteKind::Onboarding, Some(_)) => GateDecision::Allow,
            (RouteKind::Onboarding, None) => GateDecision::RedirectLogin,
            (RouteKind::Protected, session) => self.gate(session),
        }
    }

    /// Mark onboarding step `step` (1..=5) complete for the token's user.
    ///
    /// Steps at or below the current one are accepted without change. Only
    /// the next step can be recorded; skipping ahead is rejected.
    pub async fn complete_step(&self, token: &str, step: u8) -> Result<Session, OnboardingError> {
        if step == 0 || step > ONBOARDING_FINAL_STEP {
            return Err(OnboardingError::StepOutOfRange(step));
        }
        let session = self.validate(token).await?;
        let current = session.onboarding_step;

        if step <= current {
            debug!(user_id = %session.user_id, step, current, "Onboarding step already complete");
            return Ok(session);
        }
        if step != current + 1 {
            return Err(OnboardingError::StepOutOfOrder {
                current,
                requested: step,
            });
        }

        let identity = Arc::clone(&self.identity);
        let user_id = session.user_id.clone();
        let record = retry_idempotent(self.retry, "identity.record_onboarding_step", || {
            let identity = Arc::clone(&identity);
            let user_id = user_id.clone();
            async move { identity.record_onboarding_step(&user_id, step).await }
        })
        .await
        .map_err(|e| match e {
            IdentityError::Provider(p) => OnboardingError::Provider(p.to_string()),
            other => OnboardingError::Auth(auth_error(other)),
        })?;

        let mut updated = Session::from_record(record);
        updated.token_id = session.token_id;
        info!(user_id = %updated.user_id, step = updated.onboarding_step, "Onboarding step completed");
        self.remember(&updated);
        Ok(updated)
    }

    /// Last summary seen for `user_id`.
    pub fn cached(&self, user_id: &UserId) -> Option<SessionSummary> {
        self.summaries.get(user_id).map(|s| s.clone())
    }
}
