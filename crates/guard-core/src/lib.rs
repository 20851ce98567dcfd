//! Trading safety and capital allocation controller.
//!
//! Sits between a trader's dashboard and the execution engine and enforces:
//!
//! - an emergency stop that always succeeds and halts live trading
//! - a server-side confirmation handshake before moving from paper to live
//! - allocation percentages across linked venue accounts, with exactly one
//!   primary account and active allocations summing to 100
//! - an onboarding gate in front of protected routes
//!
//! Every committed change is pushed to observers over a per-user ordered
//! event stream.
//!
//! ## Modules
//!
//! - `allocation`: per-user account ledger and allocation invariant
//! - `mode`: paper/live/killed state machine and admin capability
//! - `confirmation`: single-use, expiring go-live tokens
//! - `gate`: session validation and onboarding progression
//! - `broadcast`: sequenced event fan-out, journal, execution relay, push server
//! - `collaborators`: identity, vault, balance, execution and journal seams
//! - `guard`: process-wide wiring and background tasks
//! - `api`: REST endpoints

pub mod allocation;
pub mod api;
pub mod broadcast;
pub mod collaborators;
pub mod config;
pub mod confirmation;
pub mod error;
pub mod gate;
pub mod guard;
pub mod mode;
pub mod retry;

pub use allocation::{
    AccountCreated, AccountSpec, AllocationEdit, AllocationLedger, AllocationSet,
    AllocationSummary, InvariantWarning, LedgerError, TradingAccount,
};
pub use broadcast::{
    Delivery, PushServer, PushServerConfig, StatusBroadcaster, StatusEvent, StatusPayload,
    Subscription,
};
pub use config::GuardConfig;
pub use confirmation::{ConfirmationGateway, ConfirmationToken};
pub use error::{ErrorKind, GuardError};
pub use gate::{RouteKind, Session, SessionGate};
pub use guard::{Collaborators, StatusSnapshot, StreamStart, TradingGuard};
pub use mode::{ModeController, ModeError, ModeState, TradingPhase};
