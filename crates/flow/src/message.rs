//! Inbound events and outbound records.
//!
//! Field sets are fixed; the wire format is produced by [`crate::codec`].

use serde::{Deserialize, Serialize};

use crate::checkpoint::FlowStatus;
use crate::classify::{ErrorEnvelope, ErrorKind, FlowError};
use crate::types::{Counterparty, FlowId, Payload, RequestId, SessionId};

/// An event consumed by the dispatcher, addressed to one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Partition key.
    pub flow_id: FlowId,
    /// What happened.
    pub body: InboundBody,
}

impl InboundEvent {
    /// Create an inbound event.
    pub fn new(flow_id: impl Into<FlowId>, body: InboundBody) -> Self {
        Self {
            flow_id: flow_id.into(),
            body,
        }
    }
}

/// Inbound event kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundBody {
    /// Start a new flow by name.
    StartFlow {
        flow_name: String,
        #[serde(default)]
        args: Payload,
    },
    /// A peer opened a session; starts a responder flow.
    SessionInit {
        session_id: SessionId,
        counterparty: Counterparty,
        protocol: String,
    },
    /// Data on a session.
    SessionData {
        session_id: SessionId,
        seq: u64,
        payload: Payload,
    },
    /// Cumulative acknowledgement of everything we sent up to `received_seq`.
    SessionAck {
        session_id: SessionId,
        received_seq: u64,
    },
    /// The peer closed its side of a session.
    SessionClose { session_id: SessionId, seq: u64 },
    /// The peer errored a session.
    SessionError {
        session_id: SessionId,
        error: ErrorEnvelope,
    },
    /// Response of an external service.
    ExternalEventResponse {
        request_id: RequestId,
        /// Attempt the response answers; absent when the service does not echo it.
        #[serde(default)]
        attempt: Option<u32>,
        result: ExternalResult,
    },
    /// Self-addressed continuation (`token`) or periodic tick (no token).
    Wakeup {
        #[serde(default)]
        token: Option<u64>,
    },
    /// Administrative kill.
    KillFlow { reason: String },
}

impl InboundBody {
    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StartFlow { .. } => "start_flow",
            Self::SessionInit { .. } => "session_init",
            Self::SessionData { .. } => "session_data",
            Self::SessionAck { .. } => "session_ack",
            Self::SessionClose { .. } => "session_close",
            Self::SessionError { .. } => "session_error",
            Self::ExternalEventResponse { .. } => "external_event_response",
            Self::Wakeup { .. } => "wakeup",
            Self::KillFlow { .. } => "kill_flow",
        }
    }
}

/// Outcome reported by an external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalResult {
    /// Typed output.
    Ok(Payload),
    /// Classified failure.
    Err(ErrorEnvelope),
}

/// A message on a session, as seen by the counterparty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub session_id: SessionId,
    pub counterparty: Counterparty,
    pub message: SessionMessageBody,
}

/// Session message kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionMessageBody {
    Init { protocol: String, seq: u64 },
    Data { seq: u64, payload: Payload },
    Ack { received_seq: u64 },
    Close { seq: u64 },
    Error { error: ErrorEnvelope },
}

impl SessionMessageBody {
    /// Sequence number, for sequenced messages.
    #[must_use]
    pub const fn seq(&self) -> Option<u64> {
        match self {
            Self::Init { seq, .. } | Self::Data { seq, .. } | Self::Close { seq } => Some(*seq),
            Self::Ack { .. } | Self::Error { .. } => None,
        }
    }
}

/// Published flow status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStatusRecord {
    pub flow_id: FlowId,
    pub status: FlowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl FlowStatusRecord {
    /// RUNNING status.
    #[must_use]
    pub fn running(flow_id: FlowId) -> Self {
        Self {
            flow_id,
            status: FlowStatus::Running,
            result: None,
            error_kind: None,
            error_message: None,
        }
    }

    /// COMPLETED status with the flow result.
    #[must_use]
    pub fn completed(flow_id: FlowId, result: Payload) -> Self {
        Self {
            result: Some(result),
            status: FlowStatus::Completed,
            ..Self::running(flow_id)
        }
    }

    /// FAILED or KILLED status carrying an error.
    #[must_use]
    pub fn with_error(flow_id: FlowId, status: FlowStatus, error: &FlowError) -> Self {
        Self {
            status,
            error_kind: Some(error.kind),
            error_message: Some(error.message.clone()),
            ..Self::running(flow_id)
        }
    }
}

/// What a cleanup record reclaims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum CleanupTarget {
    Flow(FlowId),
    Session(SessionId),
}

/// A record produced by processing one inbound event.
///
/// Records become visible to the transport only after the checkpoint write
/// they belong to has been committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundRecord {
    /// To a counterparty.
    Session(SessionMessage),
    /// To an external service.
    ExternalEventRequest {
        flow_id: FlowId,
        request_id: RequestId,
        factory: String,
        input: Payload,
        ttl_seconds: u64,
        attempt: u32,
    },
    /// Flow status publication.
    FlowStatus(FlowStatusRecord),
    /// Instruction to reclaim session or flow resources downstream.
    CleanupScheduled { target: CleanupTarget },
    /// Self-addressed continuation or tick.
    Wakeup {
        flow_id: FlowId,
        #[serde(default)]
        token: Option<u64>,
    },
    /// Flow parked after a Fatal failure.
    DeadLetter { flow_id: FlowId, error: FlowError },
}

impl OutboundRecord {
    /// Build a session record.
    #[must_use]
    pub fn session(
        session_id: SessionId,
        counterparty: Counterparty,
        message: SessionMessageBody,
    ) -> Self {
        Self::Session(SessionMessage {
            session_id,
            counterparty,
            message,
        })
    }

    /// The inbound event a self-addressed record turns into, if any.
    #[must_use]
    pub fn as_self_addressed(&self) -> Option<InboundEvent> {
        match self {
            Self::Wakeup { flow_id, token } => Some(InboundEvent::new(
                flow_id.clone(),
                InboundBody::Wakeup { token: *token },
            )),
            _ => None,
        }
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Session(_) => "session",
            Self::ExternalEventRequest { .. } => "external_event_request",
            Self::FlowStatus(_) => "flow_status",
            Self::CleanupScheduled { .. } => "cleanup_scheduled",
            Self::Wakeup { .. } => "wakeup",
            Self::DeadLetter { .. } => "dead_letter",
        }
    }
}
