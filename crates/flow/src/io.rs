//! What a suspended flow is waiting for.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::classify::FlowError;
use crate::types::{Counterparty, Payload, RequestId, SessionId};

/// A session the flow asks the pipeline to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInitiation {
    /// Id allocated by the flow through its context.
    pub session_id: SessionId,
    /// Peer to open the session with.
    pub counterparty: Counterparty,
    /// Name of the responder flow the peer should start.
    pub protocol: String,
}

/// The request a flow suspends on.
///
/// Stored in the checkpoint as `waiting_on`; every inbound event is evaluated
/// against it and the flow resumes only once it is fully satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowIORequest {
    /// Send one payload per session; satisfied once every session is confirmed.
    Send {
        payloads: BTreeMap<SessionId, Payload>,
    },
    /// Receive one payload from every session in the set.
    Receive { sessions: BTreeSet<SessionId> },
    /// Send then receive on the same sessions.
    SendAndReceive {
        payloads: BTreeMap<SessionId, Payload>,
    },
    /// Open sessions; satisfied once every peer has acknowledged the init.
    InitiateSession { sessions: Vec<SessionInitiation> },
    /// Close sessions; satisfied once both sides have closed every one.
    CloseSessions { sessions: BTreeSet<SessionId> },
    /// Call an external service and wait for its response.
    ExternalEvent {
        request_id: RequestId,
        factory: String,
        input: Payload,
        #[serde(default)]
        ttl_seconds: Option<u64>,
    },
    /// A sub-flow returned; close the sessions it opened.
    SubFlowFinished { sessions: BTreeSet<SessionId> },
    /// A sub-flow failed; error the sessions it opened.
    SubFlowFailed {
        sessions: BTreeSet<SessionId>,
        error: FlowError,
    },
    /// Yield and continue on the next wakeup.
    Wakeup,
}

impl FlowIORequest {
    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::Receive { .. } => "receive",
            Self::SendAndReceive { .. } => "send_and_receive",
            Self::InitiateSession { .. } => "initiate_session",
            Self::CloseSessions { .. } => "close_sessions",
            Self::ExternalEvent { .. } => "external_event",
            Self::SubFlowFinished { .. } => "sub_flow_finished",
            Self::SubFlowFailed { .. } => "sub_flow_failed",
            Self::Wakeup => "wakeup",
        }
    }

    /// Sessions this request refers to.
    #[must_use]
    pub fn sessions(&self) -> BTreeSet<SessionId> {
        match self {
            Self::Send { payloads } | Self::SendAndReceive { payloads } => {
                payloads.keys().cloned().collect()
            }
            Self::Receive { sessions }
            | Self::CloseSessions { sessions }
            | Self::SubFlowFinished { sessions }
            | Self::SubFlowFailed { sessions, .. } => sessions.clone(),
            Self::InitiateSession { sessions } => {
                sessions.iter().map(|s| s.session_id.clone()).collect()
            }
            Self::ExternalEvent { .. } | Self::Wakeup => BTreeSet::new(),
        }
    }

    /// Convenience constructor for a single-session send.
    #[must_use]
    pub fn send_to(session_id: SessionId, payload: Payload) -> Self {
        Self::Send {
            payloads: BTreeMap::from([(session_id, payload)]),
        }
    }

    /// Convenience constructor for a receive.
    pub fn receive_from(sessions: impl IntoIterator<Item = SessionId>) -> Self {
        Self::Receive {
            sessions: sessions.into_iter().collect(),
        }
    }

    /// Convenience constructor for closing sessions.
    pub fn close(sessions: impl IntoIterator<Item = SessionId>) -> Self {
        Self::CloseSessions {
            sessions: sessions.into_iter().collect(),
        }
    }
}
