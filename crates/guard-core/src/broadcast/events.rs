//! Status event types pushed to observers, the journal and the execution engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use guard_common::{StatusEventRow, UserId};

use crate::allocation::{AllocationCause, AllocationSet};
use crate::gate::SessionSummary;
use crate::mode::{TradingPhase, TransitionReason};

/// What the execution engine must do in response to a mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionDirective {
    /// Cancel open orders and flatten positions, accept no new orders.
    HaltAndFlatten,
    /// Real orders may be placed.
    EnableLive,
    /// Simulated fills only.
    PaperOnly,
}

impl ExecutionDirective {
    pub fn for_phase(phase: TradingPhase) -> Self {
        match phase {
            TradingPhase::Killed => ExecutionDirective::HaltAndFlatten,
            TradingPhase::Live => ExecutionDirective::EnableLive,
            TradingPhase::Paper | TradingPhase::LivePendingConfirm => ExecutionDirective::PaperOnly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeChange {
    pub from: TradingPhase,
    pub to: TradingPhase,
    pub reason: TransitionReason,
    pub directive: ExecutionDirective,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationChange {
    pub cause: AllocationCause,
    /// Full allocation set after the change.
    pub set: AllocationSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StatusPayload {
    ModeChanged(ModeChange),
    AllocationChanged(AllocationChange),
    SessionChanged(SessionSummary),
}

impl StatusPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            StatusPayload::ModeChanged(_) => "mode_changed",
            StatusPayload::AllocationChanged(_) => "allocation_changed",
            StatusPayload::SessionChanged(_) => "session_changed",
        }
    }

    /// The variant body without its tag.
    pub fn data_json(&self) -> serde_json::Value {
        let value = match self {
            StatusPayload::ModeChanged(c) => serde_json::to_value(c),
            StatusPayload::AllocationChanged(c) => serde_json::to_value(c),
            StatusPayload::SessionChanged(s) => serde_json::to_value(s),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

/// A committed, sequenced state change for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub user_id: UserId,
    pub seq: u64,
    pub payload: StatusPayload,
    pub emitted_at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    pub fn mode_change(&self) -> Option<&ModeChange> {
        match &self.payload {
            StatusPayload::ModeChanged(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_kill(&self) -> bool {
        self.mode_change()
            .map(|c| c.to == TradingPhase::Killed)
            .unwrap_or(false)
    }

    pub fn to_row(&self) -> StatusEventRow {
        StatusEventRow::new(
            &self.user_id,
            self.seq,
            self.event_type(),
            self.payload.data_json().to_string(),
            self.emitted_at,
        )
    }
}
