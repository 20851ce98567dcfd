//! In-process collaborator implementations.
//!
//! Used by the test suites and by `guard-server` when a collaborator URL is
//! not configured. Each type can inject failures so callers can exercise the
//! partial-failure paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use guard_common::{Platform, UserId};

use super::{
    BalanceProvider, CredentialRef, CredentialVault, EventJournal, ExecutionSink, IdentityError,
    IdentityProvider, IdentityRecord, ProviderError,
};
use crate::broadcast::StatusEvent;

/// Decrements `counter` if positive and reports whether a failure should be injected.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

// ============================================================================
// Identity
// ============================================================================

#[derive(Debug, Clone)]
struct UserProgress {
    step: u8,
}

/// Token table plus per-user onboarding progress.
#[derive(Debug, Default)]
pub struct StaticIdentityProvider {
    tokens: RwLock<HashMap<String, (UserId, String)>>,
    revoked: RwLock<HashSet<String>>,
    progress: RwLock<HashMap<UserId, UserProgress>>,
    fail_next: AtomicU32,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` for `user_id`, creating the user at `step` if unknown.
    pub fn insert_token(&self, token: &str, user_id: impl Into<UserId>, step: u8) {
        let user_id = user_id.into();
        self.progress
            .write()
            .entry(user_id.clone())
            .or_insert(UserProgress { step });
        let token_id = format!("sess-{}", Uuid::new_v4().simple());
        self.tokens
            .write()
            .insert(token.to_string(), (user_id, token_id));
    }

    pub fn revoke(&self, token: &str) {
        self.revoked.write().insert(token.to_string());
    }

    /// Server-side change of onboarding progress, e.g. by an administrator.
    pub fn set_step(&self, user_id: &UserId, step: u8) {
        self.progress
            .write()
            .insert(user_id.clone(), UserProgress { step });
    }

    /// Make the next `n` calls fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::Release);
    }

    fn record_for(&self, user_id: &UserId, token_id: String) -> IdentityRecord {
        let step = self
            .progress
            .read()
            .get(user_id)
            .map(|p| p.step)
            .unwrap_or(0);
        IdentityRecord {
            user_id: user_id.clone(),
            onboarding_step: step,
            onboarding_completed: step >= crate::gate::ONBOARDING_FINAL_STEP,
            token_id,
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn validate(&self, token: &str) -> Result<IdentityRecord, IdentityError> {
        if take_failure(&self.fail_next) {
            return Err(ProviderError::Unavailable("injected failure".to_string()).into());
        }
        if token.chars().any(char::is_whitespace) {
            return Err(IdentityError::Malformed);
        }
        if self.revoked.read().contains(token) {
            return Err(IdentityError::Revoked);
        }
        let (user_id, token_id) = self
            .tokens
            .read()
            .get(token)
            .cloned()
            .ok_or(IdentityError::Invalid)?;
        Ok(self.record_for(&user_id, token_id))
    }

    async fn record_onboarding_step(
        &self,
        user_id: &UserId,
        step: u8,
    ) -> Result<IdentityRecord, IdentityError> {
        if take_failure(&self.fail_next) {
            return Err(ProviderError::Unavailable("injected failure".to_string()).into());
        }
        {
            let mut progress = self.progress.write();
            let entry = progress
                .entry(user_id.clone())
                .or_insert(UserProgress { step: 0 });
            entry.step = entry.step.max(step);
        }
        let token_id = self
            .tokens
            .read()
            .values()
            .find(|(uid, _)| uid == user_id)
            .map(|(_, tid)| tid.clone())
            .unwrap_or_default();
        Ok(self.record_for(user_id, token_id))
    }
}

// ============================================================================
// Credential vault
// ============================================================================

/// Stores secrets in memory. Secrets can only be checked for presence.
#[derive(Debug, Default)]
pub struct MemoryVault {
    secrets: DashMap<Uuid, String>,
    broken: DashMap<Uuid, ()>,
    fail_store: AtomicU32,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, account_id: Uuid) -> bool {
        self.secrets.contains_key(&account_id)
    }

    /// Make the next `n` `store` calls fail.
    pub fn fail_next_store(&self, n: u32) {
        self.fail_store.store(n, Ordering::Release);
    }

    /// Make `test_connection` report a venue-side failure for this account.
    pub fn break_connection(&self, account_id: Uuid) {
        self.broken.insert(account_id, ());
    }
}

#[async_trait]
impl CredentialVault for MemoryVault {
    async fn store(&self, account_id: Uuid, secret: &str) -> Result<CredentialRef, ProviderError> {
        if take_failure(&self.fail_store) {
            return Err(ProviderError::Unavailable("vault write failed".to_string()));
        }
        if secret.trim().is_empty() {
            return Err(ProviderError::Rejected("empty secret".to_string()));
        }
        self.secrets.insert(account_id, secret.to_string());
        Ok(CredentialRef::new(format!("mem://{}", account_id)))
    }

    async fn test_connection(&self, account_id: Uuid) -> Result<bool, ProviderError> {
        if !self.secrets.contains_key(&account_id) {
            return Err(ProviderError::Rejected(format!(
                "no credential stored for {}",
                account_id
            )));
        }
        Ok(!self.broken.contains_key(&account_id))
    }
}

// ============================================================================
// Balances
// ============================================================================

/// Balance table for one platform with per-account failure and latency injection.
#[derive(Debug)]
pub struct FixedBalanceProvider {
    platform: Platform,
    balances: DashMap<Uuid, Decimal>,
    failing: DashMap<Uuid, ProviderError>,
    delays: DashMap<Uuid, Duration>,
    calls: AtomicU32,
}

impl FixedBalanceProvider {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            balances: DashMap::new(),
            failing: DashMap::new(),
            delays: DashMap::new(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn set_balance(&self, account_id: Uuid, amount: Decimal) {
        self.balances.insert(account_id, amount);
    }

    pub fn fail_account(&self, account_id: Uuid, error: ProviderError) {
        self.failing.insert(account_id, error);
    }

    pub fn delay_account(&self, account_id: Uuid, delay: Duration) {
        self.delays.insert(account_id, delay);
    }

    /// Number of `get_balance` calls served so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BalanceProvider for FixedBalanceProvider {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn get_balance(&self, account_id: Uuid) -> Result<Decimal, ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let delay = self.delays.get(&account_id).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failing.get(&account_id) {
            return Err(err.clone());
        }
        Ok(self
            .balances
            .get(&account_id)
            .map(|b| *b)
            .unwrap_or(Decimal::ZERO))
    }
}

// ============================================================================
// Execution sink
// ============================================================================

/// Records delivered events; can reject the next `n` deliveries.
#[derive(Debug, Default)]
pub struct RecordingExecutionSink {
    delivered: Mutex<Vec<StatusEvent>>,
    attempts: AtomicU32,
    fail_next: AtomicU32,
}

impl RecordingExecutionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::Release);
    }

    pub fn delivered(&self) -> Vec<StatusEvent> {
        self.delivered.lock().clone()
    }

    /// Total delivery attempts, successful or not.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ExecutionSink for RecordingExecutionSink {
    async fn deliver(&self, event: &StatusEvent) -> Result<(), ProviderError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if take_failure(&self.fail_next) {
            return Err(ProviderError::Unavailable("execution engine offline".to_string()));
        }
        self.delivered.lock().push(event.clone());
        Ok(())
    }
}

/// Sink used when no execution endpoint is configured: logs and acknowledges.
#[derive(Debug, Default)]
pub struct TracingExecutionSink;

#[async_trait]
impl ExecutionSink for TracingExecutionSink {
    async fn deliver(&self, event: &StatusEvent) -> Result<(), ProviderError> {
        if event.is_kill() {
            warn!(user_id = %event.user_id, seq = event.seq, "Kill switch event (no execution endpoint configured)");
        } else {
            info!(user_id = %event.user_id, seq = event.seq, event_type = event.event_type(), "Mode change (no execution endpoint configured)");
        }
        Ok(())
    }
}

// ============================================================================
// Journal
// ============================================================================

/// Keeps journaled events in memory; can fail the next `n` appends.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    events: Mutex<Vec<StatusEvent>>,
    fail_next: AtomicU32,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::Release);
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventJournal for MemoryJournal {
    async fn append(&self, events: &[StatusEvent]) -> Result<(), ProviderError> {
        if take_failure(&self.fail_next) {
            return Err(ProviderError::Unavailable("journal offline".to_string()));
        }
        self.events.lock().extend_from_slice(events);
        Ok(())
    }
}
