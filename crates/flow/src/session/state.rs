//! Persisted per-session state.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::FlowError;
use crate::message::SessionMessageBody;
use crate::types::{Counterparty, Payload, SessionId};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Init sent, not yet acknowledged.
    Created,
    /// Both sides know about the session.
    Confirmed,
    /// One side has closed.
    Closing,
    /// Both sides have closed.
    Closed,
    /// Errored by either side.
    Errored,
}

impl SessionStatus {
    /// CLOSED and ERRORED never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Confirmed => 1,
            Self::Closing => 2,
            Self::Closed | Self::Errored => 3,
        }
    }

    /// Transitions only move forward; nothing leaves a terminal status.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(next, Self::Errored) || next.rank() >= self.rank()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Confirmed => "CONFIRMED",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Errored => "ERRORED",
        };
        write!(f, "{s}")
    }
}

/// An inbound sequenced event waiting for the gap before it to fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BufferedMessage {
    Data { payload: Payload },
    Close,
}

/// A sent message retained until the peer acknowledges it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnackedMessage {
    pub message: SessionMessageBody,
    pub sent_at: DateTime<Utc>,
}

/// State of one session, owned by the flow's checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub counterparty: Counterparty,
    pub status: SessionStatus,
    /// Last sequence number assigned to an outbound message.
    pub send_seq: u64,
    /// Every outbound sequence number below this has been acknowledged.
    pub ack_watermark: u64,
    /// Next inbound sequence number that may be delivered.
    pub next_expected_recv_seq: u64,
    pub out_of_order_buffer: BTreeMap<u64, BufferedMessage>,
    /// Delivered payloads the flow has not consumed yet.
    pub received: VecDeque<Payload>,
    pub unacked: BTreeMap<u64, UnackedMessage>,
    pub close_sent: bool,
    pub close_received: bool,
    pub error: Option<FlowError>,
}

impl SessionState {
    /// A session we opened; the init message takes sequence 0.
    #[must_use]
    pub fn initiated(session_id: SessionId, counterparty: Counterparty) -> Self {
        Self {
            session_id,
            counterparty,
            status: SessionStatus::Created,
            send_seq: 0,
            ack_watermark: 0,
            next_expected_recv_seq: 1,
            out_of_order_buffer: BTreeMap::new(),
            received: VecDeque::new(),
            unacked: BTreeMap::new(),
            close_sent: false,
            close_received: false,
            error: None,
        }
    }

    /// A session a peer opened; its init consumed inbound sequence 0.
    #[must_use]
    pub fn accepted(session_id: SessionId, counterparty: Counterparty) -> Self {
        Self {
            status: SessionStatus::Confirmed,
            ..Self::initiated(session_id, counterparty)
        }
    }

    /// Check if the peer has acknowledged the session.
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        !matches!(self.status, SessionStatus::Created)
    }

    /// Check if the session is CLOSED or ERRORED.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Error of an ERRORED session.
    #[must_use]
    pub fn failure(&self) -> Option<FlowError> {
        (self.status == SessionStatus::Errored).then(|| {
            self.error.clone().unwrap_or_else(|| {
                FlowError::platform(format!("session '{}' errored", self.session_id))
            })
        })
    }

    /// Check if a receive on this session can complete now.
    #[must_use]
    pub fn has_receivable(&self) -> bool {
        !self.received.is_empty()
            || self.close_received
            || matches!(self.status, SessionStatus::Errored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_forward_only() {
        use SessionStatus::*;
        assert!(Created.can_transition_to(Confirmed));
        assert!(Created.can_transition_to(Closing));
        assert!(Confirmed.can_transition_to(Closed));
        assert!(Closing.can_transition_to(Errored));
        assert!(!Closing.can_transition_to(Confirmed));
        assert!(!Confirmed.can_transition_to(Created));
    }

    #[test]
    fn test_terminal_statuses_never_change() {
        use SessionStatus::*;
        for next in [Created, Confirmed, Closing, Closed, Errored] {
            assert!(!Closed.can_transition_to(next));
            assert!(!Errored.can_transition_to(next));
        }
    }

    #[test]
    fn test_accepted_session_is_confirmed() {
        let session = SessionState::accepted(SessionId::from("s"), Counterparty::from("bob"));
        assert!(session.is_confirmed());
        assert_eq!(session.next_expected_recv_seq, 1);
        assert_eq!(session.send_seq, 0);
    }
}
