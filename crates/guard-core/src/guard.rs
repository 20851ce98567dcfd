//! Process-wide wiring of the guard components.
//!
//! [`TradingGuard`] owns one instance of each component, runs the checks that
//! span components (go-live needs a valid allocation), builds full-state
//! snapshots for observers, and starts the background tasks: the journal
//! writer, the execution relay, and periodic maintenance (heartbeats, token
//! purge, expiry sweep).

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

use guard_common::UserId;

use crate::allocation::{AllocationLedger, AllocationSet, BalanceSettings};
use crate::broadcast::{
    ExecutionRelay, JournalWriter, JournalWriterConfig, StatusBroadcaster, StatusEvent,
    SubscribeStart, Subscription, TapFilter,
};
use crate::collaborators::{
    BalanceProvider, CredentialVault, EventJournal, ExecutionSink, IdentityProvider,
};
use crate::config::GuardConfig;
use crate::confirmation::{ConfirmationGateway, ConfirmationToken};
use crate::error::GuardError;
use crate::gate::{AuthError, GateDecision, RouteKind, Session, SessionGate, SessionSummary};
use crate::mode::{AdminAuthority, ModeController, ModeState};

/// External services the guard depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub vault: Arc<dyn CredentialVault>,
    pub balances: Vec<Arc<dyn BalanceProvider>>,
    pub execution: Arc<dyn ExecutionSink>,
    /// No journal means committed events are only kept in the replay window.
    pub journal: Option<Arc<dyn EventJournal>>,
}

/// Everything an observer needs to rebuild its view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Events up to and including this seq are reflected here.
    pub seq: u64,
    pub mode: ModeState,
    pub allocation: AllocationSet,
    pub session: Option<SessionSummary>,
}

/// How a push subscription begins.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamStart {
    Replay(Vec<StatusEvent>),
    Snapshot(StatusSnapshot),
}

/// Handles of the background tasks started by [`TradingGuard::start`].
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

pub struct TradingGuard {
    config: GuardConfig,
    broadcaster: StatusBroadcaster,
    gateway: Arc<ConfirmationGateway>,
    ledger: AllocationLedger,
    mode: ModeController,
    gate: SessionGate,
    admin: AdminAuthority,
    execution: Arc<dyn ExecutionSink>,
    journal: Option<Arc<dyn EventJournal>>,
}

impl TradingGuard {
    pub fn new(config: GuardConfig, collaborators: Collaborators) -> Self {
        let broadcaster = StatusBroadcaster::new(config.broadcast.clone());
        let gateway = Arc::new(ConfirmationGateway::new(&config.confirmation));
        let ledger = AllocationLedger::new(
            collaborators.vault,
            collaborators.balances,
            broadcaster.clone(),
            BalanceSettings::from(&config.providers),
        );
        let mode = ModeController::new(Arc::clone(&gateway), broadcaster.clone());
        let gate = SessionGate::new(
            collaborators.identity,
            broadcaster.clone(),
            config.providers.retry_policy(),
            config.providers.session_cache_ttl,
        );
        let admin = AdminAuthority::new(config.admin_key.clone());

        Self {
            config,
            broadcaster,
            gateway,
            ledger,
            mode,
            gate,
            admin,
            execution: collaborators.execution,
            journal: collaborators.journal,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> &StatusBroadcaster {
        &self.broadcaster
    }

    pub fn gateway(&self) -> &ConfirmationGateway {
        &self.gateway
    }

    pub fn ledger(&self) -> &AllocationLedger {
        &self.ledger
    }

    pub fn mode(&self) -> &ModeController {
        &self.mode
    }

    pub fn gate(&self) -> &SessionGate {
        &self.gate
    }

    pub fn admin(&self) -> &AdminAuthority {
        &self.admin
    }

    /// Start the journal writer, execution relay and maintenance loop.
    ///
    /// Call once, before serving requests, so no committed event is missed.
    pub fn start(self: &Arc<Self>) -> BackgroundTasks {
        let mut handles = Vec::new();

        let relay = ExecutionRelay::new(Arc::clone(&self.execution), &self.config.execution);
        handles.push(relay.spawn(self.broadcaster.add_tap(TapFilter::ModeChanges)));

        if let Some(journal) = &self.journal {
            let writer_config = JournalWriterConfig {
                batch_size: self.config.clickhouse.batch_size,
                flush_period: self.config.clickhouse.flush_period,
                ..Default::default()
            };
            let writer = JournalWriter::new(Arc::clone(journal), writer_config);
            handles.push(writer.spawn(self.broadcaster.add_tap(TapFilter::All)));
        }

        handles.push(self.spawn_maintenance());

        info!(tasks = handles.len(), "Guard background tasks started");
        BackgroundTasks { handles }
    }

    fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let guard = Arc::clone(self);
        let period = self.config.broadcast.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                guard.maintenance_tick();
            }
        })
    }

    /// One round of periodic work. Exposed for tests.
    pub fn maintenance_tick(&self) {
        let now = Utc::now();
        let released = self.broadcaster.heartbeat_tick();
        let expired = self.mode.expire_stale(now);
        let purged = self.gateway.purge(now);
        let forgotten = self.gate.purge_recent();
        if released + expired + purged + forgotten > 0 {
            debug!(released, expired, purged, forgotten, "Maintenance tick");
        }
    }

    /// Validate `token` and check it may use a route of kind `route`.
    pub async fn authorize(&self, token: &str, route: RouteKind) -> Result<Session, GuardError> {
        let session = self.gate.validate(token).await?;
        match self.gate.admit(Some(&session), route) {
            GateDecision::Allow => Ok(session),
            GateDecision::RedirectOnboarding { step } => Err(GuardError::OnboardingIncomplete(step)),
            GateDecision::RedirectLogin => Err(AuthError::Invalid.into()),
        }
    }

    /// Resolve the caller of an emergency stop.
    ///
    /// Admitted at onboarding level. While the identity service is down a
    /// recently validated session for the same token is accepted.
    pub async fn authorize_stop(&self, token: &str) -> Result<UserId, GuardError> {
        let session = self.gate.validate_or_recent(token).await?;
        match self.gate.admit(Some(&session), RouteKind::Onboarding) {
            GateDecision::Allow => Ok(session.user_id),
            GateDecision::RedirectOnboarding { step } => Err(GuardError::OnboardingIncomplete(step)),
            GateDecision::RedirectLogin => Err(AuthError::Invalid.into()),
        }
    }

    /// Start the go-live handshake once the allocation allows it.
    pub async fn request_live(&self, user_id: &UserId) -> Result<ConfirmationToken, GuardError> {
        let set = self.ledger.allocation_set(user_id).await;
        if set.active_count() == 0 {
            return Err(GuardError::Precondition(
                "at least one active trading account is required to go live".to_string(),
            ));
        }
        if !set.valid {
            return Err(GuardError::Precondition(format!(
                "active allocations must sum to 100% before going live (currently {}%)",
                set.sum.normalize()
            )));
        }
        Ok(self.mode.request_live(user_id)?)
    }

    /// Full current state for `user_id`.
    ///
    /// `seq` is read first, so any event committed while the snapshot is being
    /// assembled has a higher seq and is still delivered afterwards.
    pub async fn snapshot(&self, user_id: &UserId) -> StatusSnapshot {
        let seq = self.broadcaster.latest_seq(user_id);
        let mode = self.mode.state(user_id);
        let allocation = self.ledger.allocation_set(user_id).await;
        StatusSnapshot {
            seq,
            mode,
            allocation,
            session: self.gate.cached(user_id),
        }
    }

    /// Register an observer, resuming after `last_seen` when possible.
    pub async fn subscribe(
        &self,
        user_id: &UserId,
        last_seen: Option<u64>,
    ) -> (Subscription, StreamStart) {
        let (subscription, start) = self.broadcaster.subscribe(user_id, last_seen);
        let start = match start {
            SubscribeStart::Replay(events) => StreamStart::Replay(events),
            SubscribeStart::SnapshotRequired { .. } => {
                StreamStart::Snapshot(self.resync(&subscription).await)
            }
        };
        (subscription, start)
    }

    /// Snapshot for an observer whose queue overflowed; resets its baseline.
    pub async fn resync(&self, subscription: &Subscription) -> StatusSnapshot {
        let snapshot = self.snapshot(subscription.user_id()).await;
        subscription.rebase(snapshot.seq);
        snapshot
    }
}
