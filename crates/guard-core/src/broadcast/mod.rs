//! Real-time status distribution.
//!
//! - `events`: the sequenced event types
//! - `broadcaster`: per-user log, replay, bounded observer queues, heartbeats
//! - `journal`: batched audit trail fed from a broadcaster tap
//! - `relay`: at-least-once delivery of mode changes to the execution engine
//! - `server`: WebSocket push channel for dashboard clients

pub mod broadcaster;
pub mod events;
pub mod journal;
pub mod relay;
pub mod server;

pub use broadcaster::{
    BroadcastStats, Delivery, StatusBroadcaster, SubscribeStart, Subscription, TapFilter,
};
pub use events::{AllocationChange, ExecutionDirective, ModeChange, StatusEvent, StatusPayload};
pub use journal::{ClickHouseJournal, JournalWriter, JournalWriterConfig};
pub use relay::ExecutionRelay;
pub use server::{PushServer, PushServerConfig};
