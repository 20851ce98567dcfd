//! Linked trading accounts and capital allocation.
//!
//! ## Invariants
//!
//! - Active accounts' `allocation_pct` sums to 100 (within 0.01) exactly when
//!   the set is reported `valid`. Writes that break the sum are still
//!   committed; the caller gets an [`InvariantWarning`] instead of an error.
//! - A user with at least one account has exactly one primary account.
//!
//! Mutations for one user are serialized by that user's `tokio::sync::Mutex`
//! (the critical section may await the credential vault). Invariant checks
//! always run against the committed state inside that section, and the
//! `allocation_changed` event is published before the lock is released so
//! event order matches commit order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use guard_common::{pct, BalanceQuote, Environment, Platform, UserId};

use crate::broadcast::{AllocationChange, StatusBroadcaster, StatusPayload};
use crate::collaborators::{BalanceProvider, CredentialRef, CredentialVault, ProviderError};
use crate::config::ProviderConfig;
use crate::error::ErrorKind;
use crate::retry::{retry_idempotent, RetryPolicy};

/// Longest accepted account label.
const MAX_LABEL_LEN: usize = 64;

/// A linked venue account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingAccount {
    pub id: Uuid,
    pub user_id: UserId,
    pub label: String,
    pub platform: Platform,
    pub environment: Environment,
    pub is_primary: bool,
    pub is_active: bool,
    pub allocation_pct: Decimal,
    /// Present once a secret has been stored in the vault.
    pub credential_ref: Option<CredentialRef>,
    pub created_at: DateTime<Utc>,
}

/// Input for `add_account`.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSpec {
    pub label: String,
    pub platform: Platform,
    #[serde(default)]
    pub environment: Environment,
    /// Ask for this account to be primary. Only honored for the first account.
    #[serde(default)]
    pub primary: bool,
    #[serde(default = "default_active")]
    pub active: bool,
    pub allocation_pct: Decimal,
    /// Venue API secret. Sent to the vault, never stored here.
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_active() -> bool {
    true
}

impl std::fmt::Debug for AccountSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountSpec")
            .field("label", &self.label)
            .field("platform", &self.platform)
            .field("environment", &self.environment)
            .field("primary", &self.primary)
            .field("active", &self.active)
            .field("allocation_pct", &self.allocation_pct)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AccountSpec {
    pub fn new(label: impl Into<String>, platform: Platform, allocation_pct: Decimal) -> Self {
        Self {
            label: label.into(),
            platform,
            environment: Environment::default(),
            primary: false,
            active: true,
            allocation_pct,
            secret: None,
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

/// One entry of a batch allocation update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationEdit {
    pub account_id: Uuid,
    pub allocation_pct: Decimal,
}

/// Attached to a successful response when the active sum is not 100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvariantWarning {
    pub sum: Decimal,
    pub expected: Decimal,
    pub message: String,
}

/// All of a user's accounts plus the derived allocation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationSet {
    pub user_id: UserId,
    pub accounts: Vec<TradingAccount>,
    /// Sum over active accounts.
    pub sum: Decimal,
    pub valid: bool,
}

impl AllocationSet {
    fn compute(user_id: &UserId, accounts: &[TradingAccount]) -> Self {
        let sum: Decimal = accounts
            .iter()
            .filter(|a| a.is_active)
            .map(|a| a.allocation_pct)
            .sum();
        Self {
            user_id: user_id.clone(),
            accounts: accounts.to_vec(),
            sum,
            valid: pct::sums_to_total(sum),
        }
    }

    pub fn warning(&self) -> Option<InvariantWarning> {
        if self.valid {
            return None;
        }
        Some(InvariantWarning {
            sum: self.sum,
            expected: pct::TOTAL,
            message: format!(
                "Active allocations sum to {}%, expected {}%",
                self.sum.normalize(),
                pct::TOTAL
            ),
        })
    }

    pub fn primary(&self) -> Option<&TradingAccount> {
        self.accounts.iter().find(|a| a.is_primary)
    }

    pub fn account(&self, id: Uuid) -> Option<&TradingAccount> {
        self.accounts.iter().find(|a| a.id == id)
    }

    pub fn active_count(&self) -> usize {
        self.accounts.iter().filter(|a| a.is_active).count()
    }
}

/// What triggered an `allocation_changed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AllocationCause {
    AccountAdded { account_id: Uuid },
    AccountRemoved { account_id: Uuid },
    PrimaryChanged { account_id: Uuid },
    AllocationUpdated { account_ids: Vec<Uuid> },
    ActiveToggled { account_id: Uuid, active: bool },
}

/// Returned by `add_account`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCreated {
    pub account: TradingAccount,
    pub allocation: AllocationSet,
}

/// One account in a summary, with its balance or the reason it is missing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalanceView {
    #[serde(flatten)]
    pub account: TradingAccount,
    pub balance: Option<BalanceQuote>,
    pub balance_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationSummary {
    pub accounts: Vec<AccountBalanceView>,
    pub sum: Decimal,
    pub valid: bool,
    pub warning: Option<InvariantWarning>,
}

/// Result of a credential connection test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCheck {
    pub account_id: Uuid,
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("account {0} not found")]
    AccountNotFound(Uuid),

    #[error("account {0} is the primary account; choose another primary first")]
    CannotRemovePrimary(Uuid),

    #[error("a primary account already exists; use set-primary instead")]
    DuplicatePrimaryRequest,

    #[error("invalid fields: {0}")]
    InvalidFields(String),

    #[error("credential vault error: {0}")]
    Credential(ProviderError),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::AccountNotFound(_) => ErrorKind::NotFound,
            LedgerError::CannotRemovePrimary(_) | LedgerError::DuplicatePrimaryRequest => {
                ErrorKind::Conflict
            }
            LedgerError::InvalidFields(_) => ErrorKind::Validation,
            LedgerError::Credential(_) => ErrorKind::ExternalProvider,
        }
    }
}

fn check_pct(value: Decimal) -> Result<(), LedgerError> {
    if pct::is_valid(value) {
        Ok(())
    } else {
        Err(LedgerError::InvalidFields(format!(
            "allocationPct must be within [0, 100] with at most {} decimal places, got {}",
            pct::SCALE,
            value
        )))
    }
}

fn check_label(label: &str) -> Result<String, LedgerError> {
    let label = label.trim();
    if label.is_empty() {
        return Err(LedgerError::InvalidFields("label must not be empty".to_string()));
    }
    if label.chars().count() > MAX_LABEL_LEN {
        return Err(LedgerError::InvalidFields(format!(
            "label must be at most {} characters",
            MAX_LABEL_LEN
        )));
    }
    Ok(label.to_string())
}

#[derive(Debug, Default)]
struct UserBook {
    /// Insertion order.
    accounts: Vec<TradingAccount>,
}

impl UserBook {
    fn position(&self, id: Uuid) -> Result<usize, LedgerError> {
        self.accounts
            .iter()
            .position(|a| a.id == id)
            .ok_or(LedgerError::AccountNotFound(id))
    }

    fn has_primary(&self) -> bool {
        self.accounts.iter().any(|a| a.is_primary)
    }
}

/// Balance lookup settings for summaries.
#[derive(Debug, Clone)]
pub struct BalanceSettings {
    pub timeout: Duration,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
}

impl From<&ProviderConfig> for BalanceSettings {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            timeout: config.balance_timeout,
            max_concurrency: config.max_concurrency.max(1),
            retry: config.retry_policy(),
        }
    }
}

/// Per-user account books with the allocation and primary invariants.
pub struct AllocationLedger {
    books: DashMap<UserId, Arc<Mutex<UserBook>>>,
    vault: Arc<dyn CredentialVault>,
    balances: HashMap<Platform, Arc<dyn BalanceProvider>>,
    broadcaster: StatusBroadcaster,
    settings: BalanceSettings,
}

impl AllocationLedger {
    pub fn new(
        vault: Arc<dyn CredentialVault>,
        balance_providers: Vec<Arc<dyn BalanceProvider>>,
        broadcaster: StatusBroadcaster,
        settings: BalanceSettings,
    ) -> Self {
        let balances = balance_providers
            .into_iter()
            .map(|p| (p.platform(), p))
            .collect();
        Self {
            books: DashMap::new(),
            vault,
            balances,
            broadcaster,
            settings,
        }
    }

    fn book(&self, user_id: &UserId) -> Arc<Mutex<UserBook>> {
        self.books
            .entry(user_id.clone())
            .or_default()
            .value()
            .clone()
    }

    fn commit(&self, user_id: &UserId, book: &UserBook, cause: AllocationCause) -> AllocationSet {
        let set = AllocationSet::compute(user_id, &book.accounts);
        if !set.valid {
            debug!(user_id = %user_id, sum = %set.sum, "Allocation set does not sum to 100");
        }
        self.broadcaster.publish(
            user_id,
            StatusPayload::AllocationChanged(AllocationChange {
                cause,
                set: set.clone(),
            }),
        );
        set
    }

    /// Link a new account. The first account becomes primary.
    pub async fn add_account(
        &self,
        user_id: &UserId,
        spec: AccountSpec,
    ) -> Result<AccountCreated, LedgerError> {
        let label = check_label(&spec.label)?;
        check_pct(spec.allocation_pct)?;

        let book = self.book(user_id);
        let mut book = book.lock().await;

        if spec.primary && book.has_primary() {
            return Err(LedgerError::DuplicatePrimaryRequest);
        }

        let id = Uuid::new_v4();
        let credential_ref = match spec.secret.as_deref() {
            Some(secret) => Some(
                self.vault
                    .store(id, secret)
                    .await
                    .map_err(LedgerError::Credential)?,
            ),
            None => None,
        };

        let account = TradingAccount {
            id,
            user_id: user_id.clone(),
            label,
            platform: spec.platform,
            environment: spec.environment,
            is_primary: book.accounts.is_empty(),
            is_active: spec.active,
            allocation_pct: spec.allocation_pct,
            credential_ref,
            created_at: Utc::now(),
        };
        book.accounts.push(account.clone());

        info!(
            user_id = %user_id,
            account_id = %id,
            platform = %account.platform,
            primary = account.is_primary,
            allocation_pct = %account.allocation_pct,
            "Trading account added"
        );
        let allocation = self.commit(user_id, &book, AllocationCause::AccountAdded { account_id: id });
        Ok(AccountCreated {
            account,
            allocation,
        })
    }

    /// Unlink an account. The primary account cannot be removed.
    pub async fn remove_account(
        &self,
        user_id: &UserId,
        account_id: Uuid,
    ) -> Result<AllocationSet, LedgerError> {
        let book = self.book(user_id);
        let mut book = book.lock().await;

        let pos = book.position(account_id)?;
        if book.accounts[pos].is_primary {
            return Err(LedgerError::CannotRemovePrimary(account_id));
        }
        book.accounts.remove(pos);

        info!(user_id = %user_id, account_id = %account_id, "Trading account removed");
        Ok(self.commit(user_id, &book, AllocationCause::AccountRemoved { account_id }))
    }

    /// Make `account_id` the only primary account.
    pub async fn set_primary(
        &self,
        user_id: &UserId,
        account_id: Uuid,
    ) -> Result<AllocationSet, LedgerError> {
        let book = self.book(user_id);
        let mut book = book.lock().await;

        let pos = book.position(account_id)?;
        if book.accounts[pos].is_primary {
            return Ok(AllocationSet::compute(user_id, &book.accounts));
        }
        for (i, account) in book.accounts.iter_mut().enumerate() {
            account.is_primary = i == pos;
        }

        info!(user_id = %user_id, account_id = %account_id, "Primary account changed");
        Ok(self.commit(user_id, &book, AllocationCause::PrimaryChanged { account_id }))
    }

    /// Store a new percentage for one account. The raw value is always kept.
    pub async fn update_allocation(
        &self,
        user_id: &UserId,
        account_id: Uuid,
        allocation_pct: Decimal,
    ) -> Result<AllocationSet, LedgerError> {
        self.update_allocations(
            user_id,
            &[AllocationEdit {
                account_id,
                allocation_pct,
            }],
        )
        .await
    }

    /// Apply several percentage edits at once, or none if any is invalid.
    pub async fn update_allocations(
        &self,
        user_id: &UserId,
        edits: &[AllocationEdit],
    ) -> Result<AllocationSet, LedgerError> {
        if edits.is_empty() {
            return Err(LedgerError::InvalidFields("no allocations given".to_string()));
        }
        let mut seen = HashSet::with_capacity(edits.len());
        for edit in edits {
            check_pct(edit.allocation_pct)?;
            if !seen.insert(edit.account_id) {
                return Err(LedgerError::InvalidFields(format!(
                    "account {} listed more than once",
                    edit.account_id
                )));
            }
        }

        let book = self.book(user_id);
        let mut book = book.lock().await;

        let positions = edits
            .iter()
            .map(|e| book.position(e.account_id))
            .collect::<Result<Vec<_>, _>>()?;
        for (edit, pos) in edits.iter().zip(positions) {
            book.accounts[pos].allocation_pct = edit.allocation_pct;
        }

        let account_ids: Vec<Uuid> = edits.iter().map(|e| e.account_id).collect();
        info!(user_id = %user_id, accounts = account_ids.len(), "Allocations updated");
        Ok(self.commit(user_id, &book, AllocationCause::AllocationUpdated { account_ids }))
    }

    /// Include or exclude an account from the allocation sum. Its percentage is kept.
    pub async fn toggle_active(
        &self,
        user_id: &UserId,
        account_id: Uuid,
        active: bool,
    ) -> Result<AllocationSet, LedgerError> {
        let book = self.book(user_id);
        let mut book = book.lock().await;

        let pos = book.position(account_id)?;
        if book.accounts[pos].is_active == active {
            return Ok(AllocationSet::compute(user_id, &book.accounts));
        }
        book.accounts[pos].is_active = active;

        info!(user_id = %user_id, account_id = %account_id, active, "Account activation changed");
        Ok(self.commit(
            user_id,
            &book,
            AllocationCause::ActiveToggled { account_id, active },
        ))
    }

    /// Current committed allocation set.
    pub async fn allocation_set(&self, user_id: &UserId) -> AllocationSet {
        let book = self.book(user_id);
        let book = book.lock().await;
        AllocationSet::compute(user_id, &book.accounts)
    }

    /// Allocation set plus a balance for every account.
    ///
    /// Balances are fetched concurrently after the book lock is released; a
    /// failed or slow provider only annotates its own account.
    pub async fn get_summary(&self, user_id: &UserId) -> AllocationSummary {
        let set = self.allocation_set(user_id).await;
        let settings = self.settings.clone();

        let lookups = set.accounts.iter().cloned().map(|account| {
            let provider = self.balances.get(&account.platform).cloned();
            let settings = settings.clone();
            async move {
                let result = match provider {
                    Some(provider) => fetch_balance(provider, account.id, &settings).await,
                    None => Err(ProviderError::NotConfigured(format!(
                        "no balance provider for {}",
                        account.platform
                    ))),
                };
                match result {
                    Ok(amount) => AccountBalanceView {
                        account,
                        balance: Some(BalanceQuote {
                            amount,
                            as_of: Utc::now(),
                        }),
                        balance_error: None,
                    },
                    Err(e) => {
                        warn!(user_id = %account.user_id, account_id = %account.id, error = %e, "Balance lookup failed");
                        AccountBalanceView {
                            account,
                            balance: None,
                            balance_error: Some(e.to_string()),
                        }
                    }
                }
            }
        });

        let accounts: Vec<AccountBalanceView> = stream::iter(lookups)
            .buffered(settings.max_concurrency)
            .collect()
            .await;

        AllocationSummary {
            accounts,
            sum: set.sum,
            valid: set.valid,
            warning: set.warning(),
        }
    }

    /// Ask the vault whether the account's stored credential reaches the venue.
    pub async fn test_connection(
        &self,
        user_id: &UserId,
        account_id: Uuid,
    ) -> Result<ConnectionCheck, LedgerError> {
        let account = {
            let book = self.book(user_id);
            let book = book.lock().await;
            let pos = book.position(account_id)?;
            book.accounts[pos].clone()
        };

        if account.credential_ref.is_none() {
            return Ok(ConnectionCheck {
                account_id,
                ok: false,
                error: Some("no credential stored for this account".to_string()),
            });
        }

        let vault = Arc::clone(&self.vault);
        let result = retry_idempotent(self.settings.retry, "test_connection", || {
            let vault = Arc::clone(&vault);
            async move { vault.test_connection(account_id).await }
        })
        .await;

        let check = match result {
            Ok(true) => ConnectionCheck {
                account_id,
                ok: true,
                error: None,
            },
            Ok(false) => ConnectionCheck {
                account_id,
                ok: false,
                error: Some("venue rejected the stored credential".to_string()),
            },
            Err(e) => ConnectionCheck {
                account_id,
                ok: false,
                error: Some(e.to_string()),
            },
        };
        info!(user_id = %user_id, account_id = %account_id, ok = check.ok, "Connection tested");
        Ok(check)
    }
}

async fn fetch_balance(
    provider: Arc<dyn BalanceProvider>,
    account_id: Uuid,
    settings: &BalanceSettings,
) -> Result<Decimal, ProviderError> {
    let timeout = settings.timeout;
    retry_idempotent(settings.retry, "get_balance", || {
        let provider = Arc::clone(&provider);
        async move {
            match tokio::time::timeout(timeout, provider.get_balance(account_id)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(timeout)),
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::memory::{FixedBalanceProvider, MemoryVault};
    use crate::config::BroadcastConfig;
    use rust_decimal_macros::dec;

    struct Fixture {
        ledger: AllocationLedger,
        vault: Arc<MemoryVault>,
        kalshi: Arc<FixedBalanceProvider>,
        broadcaster: StatusBroadcaster,
    }

    fn fixture() -> Fixture {
        let vault = Arc::new(MemoryVault::new());
        let kalshi = Arc::new(FixedBalanceProvider::new(Platform::Kalshi));
        let poly = Arc::new(FixedBalanceProvider::new(Platform::Polymarket));
        let broadcaster = StatusBroadcaster::new(BroadcastConfig::default());
        let ledger = AllocationLedger::new(
            vault.clone(),
            vec![kalshi.clone(), poly],
            broadcaster.clone(),
            BalanceSettings {
                timeout: Duration::from_millis(50),
                max_concurrency: 4,
                retry: RetryPolicy::new(2, Duration::from_millis(1)),
            },
        );
        Fixture {
            ledger,
            vault,
            kalshi,
            broadcaster,
        }
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    #[tokio::test]
    async fn test_first_account_is_primary() {
        let f = fixture();
        let created = f
            .ledger
            .add_account(&alice(), AccountSpec::new("Main", Platform::Kalshi, dec!(100)))
            .await
            .unwrap();
        assert!(created.account.is_primary);
        assert!(created.allocation.valid);

        let second = f
            .ledger
            .add_account(&alice(), AccountSpec::new("Alt", Platform::Polymarket, dec!(0)))
            .await
            .unwrap();
        assert!(!second.account.is_primary);
        assert_eq!(second.allocation.primary().unwrap().id, created.account.id);
    }

    #[tokio::test]
    async fn test_duplicate_primary_request_rejected() {
        let f = fixture();
        f.ledger
            .add_account(&alice(), AccountSpec::new("Main", Platform::Kalshi, dec!(50)))
            .await
            .unwrap();
        let err = f
            .ledger
            .add_account(
                &alice(),
                AccountSpec::new("Other", Platform::Kalshi, dec!(50)).primary(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::DuplicatePrimaryRequest);
        assert_eq!(f.ledger.allocation_set(&alice()).await.accounts.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_fields() {
        let f = fixture();
        for bad in [dec!(-1), dec!(100.01), dec!(10.005)] {
            let err = f
                .ledger
                .add_account(&alice(), AccountSpec::new("X", Platform::Kalshi, bad))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "value {}", bad);
        }
        let err = f
            .ledger
            .add_account(&alice(), AccountSpec::new("   ", Platform::Kalshi, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidFields(_)));
    }

    #[tokio::test]
    async fn test_trailing_zeros_are_accepted() {
        let f = fixture();
        let created = f
            .ledger
            .add_account(&alice(), AccountSpec::new("X", Platform::Kalshi, dec!(33.3000)))
            .await
            .unwrap();
        assert_eq!(created.account.allocation_pct, dec!(33.30));
    }

    #[tokio::test]
    async fn test_cannot_remove_primary() {
        let f = fixture();
        let main = f
            .ledger
            .add_account(&alice(), AccountSpec::new("Main", Platform::Kalshi, dec!(60)))
            .await
            .unwrap()
            .account;
        let alt = f
            .ledger
            .add_account(&alice(), AccountSpec::new("Alt", Platform::Kalshi, dec!(40)))
            .await
            .unwrap()
            .account;

        assert_eq!(
            f.ledger.remove_account(&alice(), main.id).await,
            Err(LedgerError::CannotRemovePrimary(main.id))
        );
        let set = f.ledger.remove_account(&alice(), alt.id).await.unwrap();
        assert_eq!(set.accounts.len(), 1);
        assert!(!set.valid);
        assert_eq!(set.warning().unwrap().sum, dec!(60));
    }

    #[tokio::test]
    async fn test_set_primary_swaps_atomically() {
        let f = fixture();
        let a = f
            .ledger
            .add_account(&alice(), AccountSpec::new("A", Platform::Kalshi, dec!(50)))
            .await
            .unwrap()
            .account;
        let b = f
            .ledger
            .add_account(&alice(), AccountSpec::new("B", Platform::Kalshi, dec!(50)))
            .await
            .unwrap()
            .account;

        let set = f.ledger.set_primary(&alice(), b.id).await.unwrap();
        assert_eq!(set.accounts.iter().filter(|x| x.is_primary).count(), 1);
        assert_eq!(set.primary().unwrap().id, b.id);

        // The old primary is now removable.
        assert!(f.ledger.remove_account(&alice(), a.id).await.is_ok());
        assert_eq!(
            f.ledger.set_primary(&alice(), Uuid::new_v4()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_inactive_accounts_excluded_from_sum() {
        let f = fixture();
        f.ledger
            .add_account(&alice(), AccountSpec::new("A", Platform::Kalshi, dec!(70)))
            .await
            .unwrap();
        let b = f
            .ledger
            .add_account(&alice(), AccountSpec::new("B", Platform::Kalshi, dec!(30)))
            .await
            .unwrap()
            .account;

        let set = f.ledger.toggle_active(&alice(), b.id, false).await.unwrap();
        assert_eq!(set.sum, dec!(70));
        assert!(!set.valid);
        assert_eq!(set.account(b.id).unwrap().allocation_pct, dec!(30));

        let set = f.ledger.toggle_active(&alice(), b.id, true).await.unwrap();
        assert!(set.valid);
    }

    #[tokio::test]
    async fn test_batch_update_is_all_or_nothing() {
        let f = fixture();
        let a = f
            .ledger
            .add_account(&alice(), AccountSpec::new("A", Platform::Kalshi, dec!(50)))
            .await
            .unwrap()
            .account;
        let b = f
            .ledger
            .add_account(&alice(), AccountSpec::new("B", Platform::Kalshi, dec!(50)))
            .await
            .unwrap()
            .account;
        let before = f.broadcaster.latest_seq(&alice());

        let err = f
            .ledger
            .update_allocations(
                &alice(),
                &[
                    AllocationEdit { account_id: a.id, allocation_pct: dec!(20) },
                    AllocationEdit { account_id: Uuid::new_v4(), allocation_pct: dec!(80) },
                ],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            f.ledger.allocation_set(&alice()).await.account(a.id).unwrap().allocation_pct,
            dec!(50)
        );
        assert_eq!(f.broadcaster.latest_seq(&alice()), before);

        let set = f
            .ledger
            .update_allocations(
                &alice(),
                &[
                    AllocationEdit { account_id: a.id, allocation_pct: dec!(25) },
                    AllocationEdit { account_id: b.id, allocation_pct: dec!(75) },
                ],
            )
            .await
            .unwrap();
        assert!(set.valid);
        assert_eq!(f.broadcaster.latest_seq(&alice()), before + 1);
    }

    #[tokio::test]
    async fn test_vault_failure_is_not_committed() {
        let f = fixture();
        f.vault.fail_next_store(1);
        let err = f
            .ledger
            .add_account(
                &alice(),
                AccountSpec::new("A", Platform::Kalshi, dec!(100)).with_secret("s3cret"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalProvider);
        assert!(f.ledger.allocation_set(&alice()).await.accounts.is_empty());

        let created = f
            .ledger
            .add_account(
                &alice(),
                AccountSpec::new("A", Platform::Kalshi, dec!(100)).with_secret("s3cret"),
            )
            .await
            .unwrap();
        assert!(created.account.credential_ref.is_some());
        assert!(f.vault.contains(created.account.id));
    }

    #[tokio::test]
    async fn test_summary_annotates_failed_balances() {
        let f = fixture();
        let a = f
            .ledger
            .add_account(&alice(), AccountSpec::new("A", Platform::Kalshi, dec!(60)))
            .await
            .unwrap()
            .account;
        let b = f
            .ledger
            .add_account(&alice(), AccountSpec::new("B", Platform::Kalshi, dec!(40)))
            .await
            .unwrap()
            .account;
        let c = f
            .ledger
            .add_account(&alice(), AccountSpec::new("C", Platform::Kalshi, dec!(0)))
            .await
            .unwrap()
            .account;
        f.kalshi.set_balance(a.id, dec!(1000));
        f.kalshi.fail_account(b.id, ProviderError::Rejected("bad key".into()));
        f.kalshi.delay_account(c.id, Duration::from_millis(500));

        let summary = f.ledger.get_summary(&alice()).await;
        assert!(summary.valid);
        assert_eq!(summary.accounts.len(), 3);
        assert_eq!(summary.accounts[0].balance.as_ref().unwrap().amount, dec!(1000));
        assert!(summary.accounts[1].balance.is_none());
        assert!(summary.accounts[1].balance_error.is_some());
        assert!(summary.accounts[2].balance_error.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_connection_check_annotates() {
        let f = fixture();
        let plain = f
            .ledger
            .add_account(&alice(), AccountSpec::new("A", Platform::Kalshi, dec!(50)))
            .await
            .unwrap()
            .account;
        let keyed = f
            .ledger
            .add_account(
                &alice(),
                AccountSpec::new("B", Platform::Kalshi, dec!(50)).with_secret("k"),
            )
            .await
            .unwrap()
            .account;

        assert!(!f.ledger.test_connection(&alice(), plain.id).await.unwrap().ok);
        assert!(f.ledger.test_connection(&alice(), keyed.id).await.unwrap().ok);

        f.vault.break_connection(keyed.id);
        let check = f.ledger.test_connection(&alice(), keyed.id).await.unwrap();
        assert!(!check.ok);
        assert!(check.error.is_some());
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let f = fixture();
        f.ledger
            .add_account(&alice(), AccountSpec::new("A", Platform::Kalshi, dec!(100)))
            .await
            .unwrap();
        let bob = UserId::new("bob");
        let created = f
            .ledger
            .add_account(&bob, AccountSpec::new("B", Platform::Kalshi, dec!(100)))
            .await
            .unwrap();
        assert!(created.account.is_primary);
        assert_eq!(f.ledger.allocation_set(&bob).await.accounts.len(), 1);
    }
}
