//! Paper/live trading mode and the kill switch.
//!
//! ## State machine
//!
//! ```text
//!            request_live              confirm(ack=true)
//!   Paper ───────────────> LivePendingConfirm ─────────────> Live
//!     ^  <── cancel / request_paper /  │                       │
//!     │      ack=false / expiry ───────┘                       │
//!     │  <──────────────── request_paper ──────────────────────┘
//!     │
//!     └── admin_clear ── Killed <── emergency_stop (from any phase)
//! ```
//!
//! Every transition for one user runs under that user's lock, so an
//! `emergency_stop` racing a `confirm` is strictly ordered: whichever commits
//! second sees the other's result. Stop revokes the pending token inside the
//! same critical section, so a later confirm always fails.
//!
//! Each committed transition publishes exactly one `mode_changed` event
//! before the lock is released.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use guard_common::UserId;

use crate::broadcast::{ExecutionDirective, ModeChange, StatusBroadcaster, StatusPayload};
use crate::confirmation::{
    ConfirmError, ConfirmOperation, ConfirmationGateway, ConfirmationToken, TokenStatus,
};
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradingPhase {
    /// Simulated execution only.
    #[default]
    Paper,
    /// Live requested; waiting for the user to confirm.
    LivePendingConfirm,
    /// Real capital at risk.
    Live,
    /// Kill switch engaged. Cleared only by an administrator.
    Killed,
}

impl std::fmt::Display for TradingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingPhase::Paper => write!(f, "paper"),
            TradingPhase::LivePendingConfirm => write!(f, "live_pending_confirm"),
            TradingPhase::Live => write!(f, "live"),
            TradingPhase::Killed => write!(f, "killed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    LiveRequested,
    LiveConfirmed,
    ConfirmationDeclined,
    ConfirmationExpired,
    Cancelled,
    PaperRequested,
    EmergencyStop,
    AdminCleared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConfirmation {
    pub token_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeState {
    pub user_id: UserId,
    pub phase: TradingPhase,
    pub pending: Option<PendingConfirmation>,
    pub last_transition_at: DateTime<Utc>,
}

impl ModeState {
    fn new(user_id: &UserId) -> Self {
        Self {
            user_id: user_id.clone(),
            phase: TradingPhase::Paper,
            pending: None,
            last_transition_at: Utc::now(),
        }
    }
}

/// Response to `emergency_stop`. There is no error path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyStopAck {
    pub phase: TradingPhase,
    /// True if the kill switch was already engaged before this call.
    pub already_killed: bool,
    pub killed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModeError {
    #[error("cannot {action} while {from}")]
    InvalidTransition {
        from: TradingPhase,
        action: &'static str,
    },

    #[error("a go-live confirmation is already pending")]
    AlreadyPending,

    #[error("no go-live confirmation is pending")]
    NoPendingConfirmation,

    #[error("confirmation expired")]
    Expired,

    #[error("confirmation not acknowledged")]
    NotAcknowledged,

    #[error("confirmation already used")]
    AlreadyConsumed,

    #[error("kill switch is not engaged")]
    NotKilled,
}

impl ModeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Conflict
    }
}

impl From<ConfirmError> for ModeError {
    fn from(e: ConfirmError) -> Self {
        match e {
            ConfirmError::Expired => ModeError::Expired,
            ConfirmError::NotAcknowledged => ModeError::NotAcknowledged,
            ConfirmError::AlreadyConsumed => ModeError::AlreadyConsumed,
        }
    }
}

/// Proof that the caller presented the operator key.
///
/// Only [`AdminAuthority::authorize`] can create one, which keeps kill-switch
/// clearing out of reach of any user-facing route.
#[derive(Debug)]
pub struct AdminCapability {
    _sealed: (),
}

/// Mints [`AdminCapability`] values from the configured operator key.
#[derive(Clone)]
pub struct AdminAuthority {
    key: Option<String>,
}

impl std::fmt::Debug for AdminAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminAuthority")
            .field("configured", &self.key.is_some())
            .finish()
    }
}

impl AdminAuthority {
    pub fn new(key: Option<String>) -> Self {
        Self {
            key: key.filter(|k| !k.is_empty()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    pub fn authorize(&self, presented: &str) -> Option<AdminCapability> {
        let key = self.key.as_deref()?;
        if constant_time_eq(key.as_bytes(), presented.as_bytes()) {
            Some(AdminCapability { _sealed: () })
        } else {
            None
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Per-user mode state machines.
pub struct ModeController {
    states: DashMap<UserId, Arc<Mutex<ModeState>>>,
    gateway: Arc<ConfirmationGateway>,
    broadcaster: StatusBroadcaster,
}

impl ModeController {
    pub fn new(gateway: Arc<ConfirmationGateway>, broadcaster: StatusBroadcaster) -> Self {
        Self {
            states: DashMap::new(),
            gateway,
            broadcaster,
        }
    }

    fn slot(&self, user_id: &UserId) -> Arc<Mutex<ModeState>> {
        self.states
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ModeState::new(user_id))))
            .value()
            .clone()
    }

    /// Commit a transition and publish it. Caller holds the user's lock.
    fn transition(&self, state: &mut ModeState, to: TradingPhase, reason: TransitionReason) {
        let from = state.phase;
        state.phase = to;
        state.pending = None;
        state.last_transition_at = Utc::now();
        self.publish(state, from, reason);
    }

    fn publish(&self, state: &ModeState, from: TradingPhase, reason: TransitionReason) {
        self.broadcaster.publish(
            &state.user_id,
            StatusPayload::ModeChanged(ModeChange {
                from,
                to: state.phase,
                reason,
                directive: ExecutionDirective::for_phase(state.phase),
            }),
        );
    }

    /// Roll an expired pending request back to Paper. Caller holds the user's lock.
    fn expire_if_stale(&self, state: &mut ModeState, now: DateTime<Utc>) -> bool {
        let expired = state.phase == TradingPhase::LivePendingConfirm
            && state
                .pending
                .as_ref()
                .map(|p| now >= p.expires_at)
                .unwrap_or(true);
        if expired {
            info!(user_id = %state.user_id, "Go-live confirmation expired, back to paper");
            self.transition(state, TradingPhase::Paper, TransitionReason::ConfirmationExpired);
        }
        expired
    }

    /// Current mode. Created as Paper on first access.
    pub fn state(&self, user_id: &UserId) -> ModeState {
        let slot = self.slot(user_id);
        let mut state = slot.lock();
        self.expire_if_stale(&mut state, Utc::now());
        state.clone()
    }

    pub fn phase(&self, user_id: &UserId) -> TradingPhase {
        self.state(user_id).phase
    }

    /// Start the go-live handshake. Only valid from Paper.
    pub fn request_live(&self, user_id: &UserId) -> Result<ConfirmationToken, ModeError> {
        let slot = self.slot(user_id);
        let mut state = slot.lock();
        self.expire_if_stale(&mut state, Utc::now());

        match state.phase {
            TradingPhase::Paper => {
                let token = self.gateway.issue(user_id, ConfirmOperation::GoLive);
                let from = state.phase;
                state.phase = TradingPhase::LivePendingConfirm;
                state.pending = Some(PendingConfirmation {
                    token_id: token.id,
                    expires_at: token.expires_at,
                });
                state.last_transition_at = Utc::now();
                self.publish(&state, from, TransitionReason::LiveRequested);
                info!(user_id = %user_id, token_id = %token.id, expires_at = %token.expires_at, "Go-live requested");
                Ok(token)
            }
            TradingPhase::LivePendingConfirm => Err(ModeError::AlreadyPending),
            from => Err(ModeError::InvalidTransition {
                from,
                action: "request live",
            }),
        }
    }

    /// Redeem the go-live token. `ack=false` and expiry both return to Paper.
    pub fn confirm(
        &self,
        user_id: &UserId,
        token_id: Uuid,
        ack: bool,
    ) -> Result<ModeState, ModeError> {
        let slot = self.slot(user_id);
        let mut state = slot.lock();
        self.expire_if_stale(&mut state, Utc::now());

        let pending_id = state.pending.as_ref().map(|p| p.token_id);
        if state.phase != TradingPhase::LivePendingConfirm || pending_id != Some(token_id) {
            // Not the live request: explain what happened to the presented token.
            return Err(match self.gateway.status(user_id, token_id) {
                TokenStatus::Unknown => ModeError::NoPendingConfirmation,
                TokenStatus::Consumed => ModeError::AlreadyConsumed,
                TokenStatus::Outstanding | TokenStatus::Expired | TokenStatus::Revoked => {
                    ModeError::Expired
                }
            });
        }

        match self
            .gateway
            .redeem(user_id, token_id, ConfirmOperation::GoLive, ack)
        {
            Ok(_) => {
                self.transition(&mut state, TradingPhase::Live, TransitionReason::LiveConfirmed);
                warn!(user_id = %user_id, "Live trading enabled");
                Ok(state.clone())
            }
            Err(e) => {
                let reason = match e {
                    ConfirmError::NotAcknowledged => TransitionReason::ConfirmationDeclined,
                    _ => TransitionReason::ConfirmationExpired,
                };
                self.transition(&mut state, TradingPhase::Paper, reason);
                info!(user_id = %user_id, error = %e, "Go-live confirmation failed, back to paper");
                Err(e.into())
            }
        }
    }

    /// Abandon a pending go-live request.
    pub fn cancel(&self, user_id: &UserId) -> Result<ModeState, ModeError> {
        let slot = self.slot(user_id);
        let mut state = slot.lock();
        self.expire_if_stale(&mut state, Utc::now());

        match state.phase {
            TradingPhase::Paper => Ok(state.clone()),
            TradingPhase::LivePendingConfirm => {
                self.revoke_pending(&state);
                self.transition(&mut state, TradingPhase::Paper, TransitionReason::Cancelled);
                info!(user_id = %user_id, "Go-live request cancelled");
                Ok(state.clone())
            }
            from => Err(ModeError::InvalidTransition {
                from,
                action: "cancel",
            }),
        }
    }

    /// Go back to paper trading. Never gated, except that it cannot clear a kill.
    pub fn request_paper(&self, user_id: &UserId) -> Result<ModeState, ModeError> {
        let slot = self.slot(user_id);
        let mut state = slot.lock();
        self.expire_if_stale(&mut state, Utc::now());

        match state.phase {
            TradingPhase::Paper => Ok(state.clone()),
            TradingPhase::LivePendingConfirm | TradingPhase::Live => {
                self.revoke_pending(&state);
                self.transition(&mut state, TradingPhase::Paper, TransitionReason::PaperRequested);
                info!(user_id = %user_id, "Switched to paper trading");
                Ok(state.clone())
            }
            TradingPhase::Killed => Err(ModeError::InvalidTransition {
                from: TradingPhase::Killed,
                action: "switch to paper",
            }),
        }
    }

    /// Engage the kill switch. Always succeeds; repeat calls change nothing.
    pub fn emergency_stop(&self, user_id: &UserId) -> EmergencyStopAck {
        let slot = self.slot(user_id);
        let mut state = slot.lock();

        if state.phase == TradingPhase::Killed {
            debug!(user_id = %user_id, "Emergency stop repeated, already killed");
            return EmergencyStopAck {
                phase: TradingPhase::Killed,
                already_killed: true,
                killed_at: state.last_transition_at,
            };
        }

        self.revoke_pending(&state);
        let from = state.phase;
        self.transition(&mut state, TradingPhase::Killed, TransitionReason::EmergencyStop);
        warn!(user_id = %user_id, from = %from, "EMERGENCY STOP: kill switch engaged");

        EmergencyStopAck {
            phase: TradingPhase::Killed,
            already_killed: false,
            killed_at: state.last_transition_at,
        }
    }

    /// Clear an engaged kill switch. Requires the operator capability.
    pub fn admin_clear(
        &self,
        _capability: &AdminCapability,
        user_id: &UserId,
    ) -> Result<ModeState, ModeError> {
        let slot = self.slot(user_id);
        let mut state = slot.lock();

        if state.phase != TradingPhase::Killed {
            return Err(ModeError::NotKilled);
        }
        self.transition(&mut state, TradingPhase::Paper, TransitionReason::AdminCleared);
        warn!(user_id = %user_id, "Kill switch cleared by administrator");
        Ok(state.clone())
    }

    /// Roll back every expired pending request. Returns how many were rolled back.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> usize {
        let slots: Vec<Arc<Mutex<ModeState>>> =
            self.states.iter().map(|e| e.value().clone()).collect();
        slots
            .into_iter()
            .filter(|slot| {
                let mut state = slot.lock();
                self.expire_if_stale(&mut state, now)
            })
            .count()
    }

    fn revoke_pending(&self, state: &ModeState) {
        if let Some(pending) = &state.pending {
            self.gateway.revoke(pending.token_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Delivery;
    use crate::config::BroadcastConfig;
    use std::time::Duration;

    fn controller(ttl: Duration) -> (ModeController, StatusBroadcaster, Arc<ConfirmationGateway>) {
        let broadcaster = StatusBroadcaster::new(BroadcastConfig::default());
        let gateway = Arc::new(ConfirmationGateway::with_ttl(ttl, Duration::from_secs(600)));
        (
            ModeController::new(gateway.clone(), broadcaster.clone()),
            broadcaster,
            gateway,
        )
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    #[test]
    fn test_starts_in_paper() {
        let (mode, broadcaster, _) = controller(Duration::from_secs(60));
        assert_eq!(mode.phase(&alice()), TradingPhase::Paper);
        assert_eq!(broadcaster.latest_seq(&alice()), 0);
    }

    #[test]
    fn test_request_and_confirm_goes_live() {
        let (mode, _, _) = controller(Duration::from_secs(60));
        let token = mode.request_live(&alice()).unwrap();
        assert_eq!(mode.phase(&alice()), TradingPhase::LivePendingConfirm);
        assert_eq!(mode.request_live(&alice()), Err(ModeError::AlreadyPending));

        let state = mode.confirm(&alice(), token.id, true).unwrap();
        assert_eq!(state.phase, TradingPhase::Live);
        assert!(state.pending.is_none());

        // The token is single-use.
        assert_eq!(
            mode.confirm(&alice(), token.id, true),
            Err(ModeError::AlreadyConsumed)
        );
    }

    #[test]
    fn test_decline_returns_to_paper() {
        let (mode, _, _) = controller(Duration::from_secs(60));
        let token = mode.request_live(&alice()).unwrap();
        assert_eq!(
            mode.confirm(&alice(), token.id, false),
            Err(ModeError::NotAcknowledged)
        );
        assert_eq!(mode.phase(&alice()), TradingPhase::Paper);
    }

    #[test]
    fn test_confirm_without_request() {
        let (mode, _, _) = controller(Duration::from_secs(60));
        assert_eq!(
            mode.confirm(&alice(), Uuid::new_v4(), true),
            Err(ModeError::NoPendingConfirmation)
        );
    }

    #[test]
    fn test_stale_token_after_new_request() {
        let (mode, _, _) = controller(Duration::from_secs(60));
        let first = mode.request_live(&alice()).unwrap();
        mode.cancel(&alice()).unwrap();
        let second = mode.request_live(&alice()).unwrap();

        assert_eq!(mode.confirm(&alice(), first.id, true), Err(ModeError::Expired));
        assert_eq!(mode.phase(&alice()), TradingPhase::LivePendingConfirm);
        assert!(mode.confirm(&alice(), second.id, true).is_ok());
    }

    #[tokio::test]
    async fn test_expired_confirmation_rolls_back() {
        let (mode, broadcaster, _) = controller(Duration::from_millis(20));
        let token = mode.request_live(&alice()).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(mode.confirm(&alice(), token.id, true), Err(ModeError::Expired));
        assert_eq!(mode.phase(&alice()), TradingPhase::Paper);
        // requested + expired
        assert_eq!(broadcaster.latest_seq(&alice()), 2);
    }

    #[tokio::test]
    async fn test_expire_stale_sweep() {
        let (mode, _, _) = controller(Duration::from_millis(10));
        mode.request_live(&alice()).unwrap();
        mode.request_live(&UserId::new("bob")).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(mode.expire_stale(Utc::now()), 2);
        assert_eq!(mode.expire_stale(Utc::now()), 0);
        // An expired request counts as Paper for the next request.
        assert!(mode.request_live(&alice()).is_ok());
    }

    /// Drive alice to `phase`, returning the outstanding token if any.
    fn drive_to(mode: &ModeController, phase: TradingPhase) -> Option<Uuid> {
        match phase {
            TradingPhase::Paper => None,
            TradingPhase::LivePendingConfirm => Some(mode.request_live(&alice()).unwrap().id),
            TradingPhase::Live => {
                let token = mode.request_live(&alice()).unwrap();
                mode.confirm(&alice(), token.id, true).unwrap();
                None
            }
            TradingPhase::Killed => unreachable!(),
        }
    }

    #[test]
    fn test_emergency_stop_is_idempotent() {
        for start in [
            TradingPhase::Paper,
            TradingPhase::LivePendingConfirm,
            TradingPhase::Live,
        ] {
            let (mode, broadcaster, gateway) = controller(Duration::from_secs(60));
            let pending = drive_to(&mode, start);
            assert_eq!(mode.phase(&alice()), start);
            let before = broadcaster.latest_seq(&alice());
            let (sub, _) = broadcaster.subscribe(&alice(), Some(before));

            let first = mode.emergency_stop(&alice());
            assert!(!first.already_killed, "from {:?}", start);
            for _ in 0..5 {
                let ack = mode.emergency_stop(&alice());
                assert!(ack.already_killed);
                assert_eq!(ack.phase, TradingPhase::Killed);
                assert_eq!(ack.killed_at, first.killed_at);
            }
            assert_eq!(broadcaster.latest_seq(&alice()), before + 1, "from {:?}", start);

            let mut kills = 0;
            while let Some(delivery) = sub.try_recv() {
                if let Delivery::Event(event) = delivery {
                    let change = event.mode_change().unwrap();
                    assert_eq!(change.to, TradingPhase::Killed);
                    assert_eq!(change.from, start);
                    kills += 1;
                }
            }
            assert_eq!(kills, 1, "from {:?}", start);

            if let Some(token) = pending {
                assert_eq!(gateway.status(&alice(), token), TokenStatus::Revoked);
                assert_eq!(mode.confirm(&alice(), token, true), Err(ModeError::Expired));
            }
            assert!(mode.state(&alice()).pending.is_none());
        }
    }

    #[test]
    fn test_stop_invalidates_pending_token() {
        let (mode, _, gateway) = controller(Duration::from_secs(60));
        let token = mode.request_live(&alice()).unwrap();
        mode.emergency_stop(&alice());

        assert_eq!(gateway.status(&alice(), token.id), TokenStatus::Revoked);
        assert_eq!(mode.confirm(&alice(), token.id, true), Err(ModeError::Expired));
        assert_eq!(mode.phase(&alice()), TradingPhase::Killed);
    }

    #[test]
    fn test_killed_leaves_only_via_admin_clear() {
        let (mode, _, _) = controller(Duration::from_secs(60));
        mode.emergency_stop(&alice());

        assert!(mode.request_paper(&alice()).is_err());
        assert!(mode.cancel(&alice()).is_err());
        assert!(mode.request_live(&alice()).is_err());
        assert_eq!(mode.phase(&alice()), TradingPhase::Killed);

        let authority = AdminAuthority::new(Some("operator-key-0123456789".to_string()));
        assert!(authority.authorize("wrong").is_none());
        let cap = authority.authorize("operator-key-0123456789").unwrap();
        let state = mode.admin_clear(&cap, &alice()).unwrap();
        assert_eq!(state.phase, TradingPhase::Paper);
        assert_eq!(mode.admin_clear(&cap, &alice()), Err(ModeError::NotKilled));
    }

    #[test]
    fn test_unconfigured_authority_mints_nothing() {
        let authority = AdminAuthority::new(None);
        assert!(!authority.is_configured());
        assert!(authority.authorize("").is_none());
        assert!(AdminAuthority::new(Some(String::new())).authorize("").is_none());
    }

    #[test]
    fn test_request_paper_from_live_and_pending() {
        let (mode, _, gateway) = controller(Duration::from_secs(60));
        let token = mode.request_live(&alice()).unwrap();
        mode.request_paper(&alice()).unwrap();
        assert_eq!(gateway.status(&alice(), token.id), TokenStatus::Revoked);

        let token = mode.request_live(&alice()).unwrap();
        mode.confirm(&alice(), token.id, true).unwrap();
        let state = mode.request_paper(&alice()).unwrap();
        assert_eq!(state.phase, TradingPhase::Paper);
    }
}
