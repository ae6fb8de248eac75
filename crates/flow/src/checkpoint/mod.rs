//! Durable flow state.
//!
//! A checkpoint exists exactly while its flow is RUNNING. It is created by
//! the initial transition of `StartFlow` or a peer's session init, rewritten
//! after every applied event, and deleted on any terminal status.

mod codec;
mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::FlowError;
use crate::external::ExternalEventState;
use crate::io::FlowIORequest;
use crate::session::SessionState;
use crate::types::{FlowId, Payload, RequestId, SessionId};

pub use codec::CheckpointCodec;
pub use store::{CheckpointStore, CheckpointWrite, Commit, InMemoryCheckpointStore};

/// Status of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

impl FlowStatus {
    /// Check if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
        };
        write!(f, "{s}")
    }
}

/// Suspended state of one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub flow_id: FlowId,
    /// Registry name of the flow logic.
    pub flow_name: String,
    pub status: FlowStatus,
    /// What the flow is suspended on.
    pub waiting_on: Option<FlowIORequest>,
    pub sessions: BTreeMap<SessionId, SessionState>,
    pub pending_external_events: BTreeMap<RequestId, ExternalEventState>,
    /// Requests whose resolution has been handed to the flow.
    #[serde(default)]
    pub completed_requests: BTreeSet<RequestId>,
    /// State owned by flow logic.
    #[serde(default)]
    pub flow_state: Payload,
    pub next_session_ordinal: u64,
    pub next_request_ordinal: u64,
    pub next_wakeup_token: u64,
    /// Token of the self-addressed wakeup the flow waits for, if any.
    pub pending_wakeup: Option<u64>,
    /// Failure raised while setting up the current wait.
    pub wait_error: Option<FlowError>,
    /// Set once the flow has been dead-lettered; it never resumes after that.
    pub dead_letter: Option<FlowError>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Initial checkpoint of a flow.
    #[must_use]
    pub fn initial(flow_id: FlowId, flow_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            flow_id,
            flow_name: flow_name.into(),
            status: FlowStatus::Running,
            waiting_on: None,
            sessions: BTreeMap::new(),
            pending_external_events: BTreeMap::new(),
            completed_requests: BTreeSet::new(),
            flow_state: Payload::Null,
            next_session_ordinal: 0,
            next_request_ordinal: 0,
            next_wakeup_token: 0,
            pending_wakeup: None,
            wait_error: None,
            dead_letter: None,
            created_at: now,
        }
    }

    /// Allocate the token for the next self-addressed wakeup.
    pub fn allocate_wakeup_token(&mut self) -> u64 {
        let token = self.next_wakeup_token;
        self.next_wakeup_token = self.next_wakeup_token.saturating_add(1);
        self.pending_wakeup = Some(token);
        token
    }

    /// Sessions that are not CLOSED, in id order.
    #[must_use]
    pub fn unclosed_sessions(&self) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.status != crate::session::SessionStatus::Closed)
            .map(|s| s.session_id.clone())
            .collect()
    }
}
