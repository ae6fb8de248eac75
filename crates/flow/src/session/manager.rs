//! Session sequencing, buffering, acknowledgement and lifecycle.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use super::state::{BufferedMessage, SessionState, SessionStatus, UnackedMessage};
use crate::classify::FlowError;
use crate::io::SessionInitiation;
use crate::message::{OutboundRecord, SessionMessageBody};
use crate::types::{Counterparty, Payload, SessionId};

/// Result of a sequenced inbound event (data or close).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    /// Delivered, together with anything it unblocked in the buffer.
    Delivered,
    /// Ahead of the expected sequence; held until the gap fills.
    Buffered,
    /// Already seen; discarded.
    Duplicate,
    /// Arrived after the peer closed or the session ended; discarded.
    Ignored,
    /// Too far ahead of the expected sequence to buffer; discarded.
    OutOfRange,
}

/// Result of an inbound acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Advanced,
    Duplicate,
    /// Acknowledges a sequence number that was never sent.
    Invalid,
}

/// Result of an inbound session error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOutcome {
    Errored,
    AlreadyTerminal,
}

/// Effect of applying one event to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdate<O> {
    pub outcome: O,
    /// Records to emit with the checkpoint.
    pub records: Vec<OutboundRecord>,
    /// The session reached CLOSED or ERRORED during this update.
    pub terminated: bool,
}

impl<O> SessionUpdate<O> {
    fn unchanged(outcome: O) -> Self {
        Self {
            outcome,
            records: Vec::new(),
            terminated: false,
        }
    }
}

/// Owns the per-session protocol rules.
///
/// Sequence numbers run per direction. Our init takes 0 and every data or
/// close message after it takes the next number; the peer's messages are
/// delivered strictly in order starting at 1, with later ones buffered and
/// earlier ones discarded. Acknowledgements are cumulative, carry the next
/// expected sequence number, and are emitted only once delivery is
/// contiguous. A peer message more than `max_lookahead` past the expected
/// sequence number is refused rather than buffered.
#[derive(Debug, Clone)]
pub struct SessionManager {
    resend_window: Duration,
    max_lookahead: u64,
}

impl SessionManager {
    /// Default bound on how far ahead a peer message may be buffered.
    pub const DEFAULT_MAX_LOOKAHEAD: u64 = 1_024;

    /// Create a manager resending unacknowledged messages after `resend_window`.
    #[must_use]
    pub const fn new(resend_window: Duration) -> Self {
        Self {
            resend_window,
            max_lookahead: Self::DEFAULT_MAX_LOOKAHEAD,
        }
    }

    /// Bound the out-of-order buffer to `max_lookahead` sequence numbers.
    #[must_use]
    pub const fn with_max_lookahead(mut self, max_lookahead: u64) -> Self {
        self.max_lookahead = max_lookahead;
        self
    }

    /// Open a session with a counterparty.
    ///
    /// The session starts CREATED and the init message (seq 0) is retained
    /// until acknowledged.
    ///
    /// # Errors
    ///
    /// Returns a platform error if the session id is already in use.
    pub fn create_session(
        &self,
        sessions: &mut BTreeMap<SessionId, SessionState>,
        initiation: &SessionInitiation,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboundRecord>, FlowError> {
        if sessions.contains_key(&initiation.session_id) {
            return Err(FlowError::platform(format!(
                "session '{}' already exists",
                initiation.session_id
            )));
        }
        let mut session = SessionState::initiated(
            initiation.session_id.clone(),
            initiation.counterparty.clone(),
        );
        let init = SessionMessageBody::Init {
            protocol: initiation.protocol.clone(),
            seq: 0,
        };
        let record = retain_and_emit(&mut session, init, now);
        debug!(
            session_id = %initiation.session_id,
            counterparty = %initiation.counterparty,
            protocol = %initiation.protocol,
            "Session created"
        );
        sessions.insert(initiation.session_id.clone(), session);
        Ok(vec![record])
    }

    /// Accept a session a peer opened and acknowledge its init.
    ///
    /// # Errors
    ///
    /// Returns a platform error if the session id is already in use.
    pub fn accept_session(
        &self,
        sessions: &mut BTreeMap<SessionId, SessionState>,
        session_id: SessionId,
        counterparty: Counterparty,
    ) -> Result<Vec<OutboundRecord>, FlowError> {
        if sessions.contains_key(&session_id) {
            return Err(FlowError::platform(format!(
                "session '{session_id}' already exists"
            )));
        }
        let session = SessionState::accepted(session_id.clone(), counterparty.clone());
        let ack = OutboundRecord::session(
            session_id.clone(),
            counterparty,
            SessionMessageBody::Ack { received_seq: 1 },
        );
        debug!(session_id = %session_id, "Session accepted");
        sessions.insert(session_id, session);
        Ok(vec![ack])
    }

    /// Apply a cumulative acknowledgement from the peer.
    ///
    /// `received_seq` is the peer's next expected sequence number: every
    /// message we sent below it has arrived.
    pub fn on_ack(&self, session: &mut SessionState, received_seq: u64) -> SessionUpdate<AckOutcome> {
        if received_seq > session.send_seq.saturating_add(1) {
            warn!(
                session_id = %session.session_id,
                received_seq,
                send_seq = session.send_seq,
                "Acknowledgement for a sequence never sent"
            );
            return SessionUpdate::unchanged(AckOutcome::Invalid);
        }
        if received_seq <= session.ack_watermark {
            return SessionUpdate::unchanged(AckOutcome::Duplicate);
        }

        session.ack_watermark = received_seq;
        session.unacked.retain(|seq, _| *seq >= received_seq);
        if session.status == SessionStatus::Created {
            transition(session, SessionStatus::Confirmed);
        }
        SessionUpdate::unchanged(AckOutcome::Advanced)
    }

    /// Apply an inbound data message.
    pub fn on_data(
        &self,
        session: &mut SessionState,
        seq: u64,
        payload: Payload,
    ) -> SessionUpdate<DataOutcome> {
        self.on_sequenced(session, seq, BufferedMessage::Data { payload })
    }

    /// Apply an inbound close.
    ///
    /// A close is sequenced like data. Once delivered the peer's side is
    /// closed; the session is CLOSED if our side was closed too.
    pub fn on_close(&self, session: &mut SessionState, seq: u64) -> SessionUpdate<DataOutcome> {
        self.on_sequenced(session, seq, BufferedMessage::Close)
    }

    fn on_sequenced(
        &self,
        session: &mut SessionState,
        seq: u64,
        message: BufferedMessage,
    ) -> SessionUpdate<DataOutcome> {
        let expected = session.next_expected_recv_seq;
        if seq < expected || session.out_of_order_buffer.contains_key(&seq) {
            debug!(session_id = %session.session_id, seq, expected, "Duplicate session message");
            return SessionUpdate::unchanged(DataOutcome::Duplicate);
        }
        if session.is_terminal() || session.close_received {
            warn!(
                session_id = %session.session_id,
                seq,
                status = %session.status,
                "Session message after close"
            );
            return SessionUpdate::unchanged(DataOutcome::Ignored);
        }
        if seq.saturating_sub(expected) > self.max_lookahead {
            warn!(
                session_id = %session.session_id,
                seq,
                expected,
                max_lookahead = self.max_lookahead,
                "Session message too far ahead"
            );
            return SessionUpdate::unchanged(DataOutcome::OutOfRange);
        }
        if seq > expected {
            debug!(session_id = %session.session_id, seq, expected, "Session message buffered");
            session.out_of_order_buffer.insert(seq, message);
            return SessionUpdate::unchanged(DataOutcome::Buffered);
        }

        deliver(session, message);
        while !session.close_received {
            let next = session.next_expected_recv_seq;
            let Some(buffered) = session.out_of_order_buffer.remove(&next) else {
                break;
            };
            deliver(session, buffered);
        }
        if session.close_received {
            session.out_of_order_buffer.clear();
        }

        let received_seq = session.next_expected_recv_seq;
        debug!(
            session_id = %session.session_id,
            seq,
            received_seq,
            "Session message delivered"
        );
        let ack = OutboundRecord::session(
            session.session_id.clone(),
            session.counterparty.clone(),
            SessionMessageBody::Ack { received_seq },
        );
        SessionUpdate {
            outcome: DataOutcome::Delivered,
            records: vec![ack],
            terminated: session.is_terminal(),
        }
    }

    /// Apply an error reported by the peer.
    pub fn on_error(&self, session: &mut SessionState, error: FlowError) -> SessionUpdate<ErrorOutcome> {
        if session.is_terminal() {
            return SessionUpdate::unchanged(ErrorOutcome::AlreadyTerminal);
        }
        warn!(session_id = %session.session_id, error = %error, "Session errored by counterparty");
        mark_errored(session, error);
        SessionUpdate {
            outcome: ErrorOutcome::Errored,
            records: Vec::new(),
            terminated: true,
        }
    }

    /// True if any session in the set is ERRORED, otherwise only if every
    /// session has a delivered payload waiting or was closed by the peer.
    #[must_use]
    pub fn is_receive_satisfied(
        &self,
        sessions: &BTreeMap<SessionId, SessionState>,
        wanted: &BTreeSet<SessionId>,
    ) -> bool {
        let errored = wanted
            .iter()
            .any(|id| sessions.get(id).is_some_and(|s| s.failure().is_some()));
        errored
            || wanted
                .iter()
                .all(|id| sessions.get(id).is_some_and(SessionState::has_receivable))
    }

    /// Consume one delivered payload from every session in the set.
    ///
    /// Nothing is consumed when any session cannot deliver.
    ///
    /// # Errors
    ///
    /// Returns the session's error if one is ERRORED, or a platform error if
    /// one was closed by the peer while the flow still expected data.
    pub fn take_received(
        &self,
        sessions: &mut BTreeMap<SessionId, SessionState>,
        wanted: &BTreeSet<SessionId>,
    ) -> Result<BTreeMap<SessionId, Payload>, FlowError> {
        if let Some(error) = wanted
            .iter()
            .find_map(|id| sessions.get(id).and_then(SessionState::failure))
        {
            return Err(error);
        }
        for id in wanted {
            let session = sessions
                .get(id)
                .ok_or_else(|| FlowError::platform(format!("session '{id}' not found")))?;
            if session.received.is_empty() {
                return Err(FlowError::platform(format!(
                    "session '{id}' closed by counterparty while data was expected"
                )));
            }
        }

        Ok(wanted
            .iter()
            .filter_map(|id| {
                sessions
                    .get_mut(id)
                    .and_then(|session| session.received.pop_front())
                    .map(|payload| (id.clone(), payload))
            })
            .collect())
    }

    /// Send one payload on a session.
    ///
    /// # Errors
    ///
    /// Returns the session's error if it is ERRORED, or a platform error if
    /// either side has closed it.
    pub fn send(
        &self,
        session: &mut SessionState,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboundRecord>, FlowError> {
        if let Some(error) = session.failure() {
            return Err(error);
        }
        if session.close_sent || session.close_received || session.is_terminal() {
            return Err(FlowError::platform(format!(
                "session '{}' is closed",
                session.session_id
            )));
        }
        let seq = session.send_seq.saturating_add(1);
        session.send_seq = seq;
        Ok(vec![retain_and_emit(
            session,
            SessionMessageBody::Data { seq, payload },
            now,
        )])
    }

    /// Close our side of a session. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the session's error if it is ERRORED.
    pub fn close(
        &self,
        session: &mut SessionState,
        now: DateTime<Utc>,
    ) -> Result<SessionUpdate<()>, FlowError> {
        if let Some(error) = session.failure() {
            return Err(error);
        }
        if session.close_sent {
            return Ok(SessionUpdate::unchanged(()));
        }
        let seq = session.send_seq.saturating_add(1);
        session.send_seq = seq;
        session.close_sent = true;
        let record = retain_and_emit(session, SessionMessageBody::Close { seq }, now);
        let next = closing_status(session);
        transition(session, next);
        debug!(session_id = %session.session_id, seq, status = %session.status, "Session close sent");
        Ok(SessionUpdate {
            outcome: (),
            records: vec![record],
            terminated: session.status == SessionStatus::Closed,
        })
    }

    /// Error a session from our side and tell the peer.
    ///
    /// No-op for a session that is already CLOSED or ERRORED.
    pub fn error_session(&self, session: &mut SessionState, error: &FlowError) -> SessionUpdate<()> {
        if session.is_terminal() {
            return SessionUpdate::unchanged(());
        }
        let record = OutboundRecord::session(
            session.session_id.clone(),
            session.counterparty.clone(),
            SessionMessageBody::Error {
                error: error.to_envelope(),
            },
        );
        debug!(session_id = %session.session_id, error = %error, "Session errored locally");
        mark_errored(session, error.clone());
        SessionUpdate {
            outcome: (),
            records: vec![record],
            terminated: true,
        }
    }

    /// Re-emit every unacknowledged message older than the resend window.
    pub fn resend_unacked(&self, session: &mut SessionState, now: DateTime<Utc>) -> Vec<OutboundRecord> {
        if session.is_terminal() {
            return Vec::new();
        }
        let session_id = session.session_id.clone();
        let counterparty = session.counterparty.clone();
        session
            .unacked
            .iter_mut()
            .filter(|(_, unacked)| now - unacked.sent_at >= self.resend_window)
            .map(|(seq, unacked)| {
                debug!(session_id = %session_id, seq, "Resending unacknowledged message");
                unacked.sent_at = now;
                OutboundRecord::session(
                    session_id.clone(),
                    counterparty.clone(),
                    unacked.message.clone(),
                )
            })
            .collect()
    }
}

fn deliver(session: &mut SessionState, message: BufferedMessage) {
    match message {
        BufferedMessage::Data { payload } => session.received.push_back(payload),
        BufferedMessage::Close => {
            session.close_received = true;
            let next = closing_status(session);
            transition(session, next);
        }
    }
    session.next_expected_recv_seq = session.next_expected_recv_seq.saturating_add(1);
}

fn closing_status(session: &SessionState) -> SessionStatus {
    if session.close_sent && session.close_received {
        SessionStatus::Closed
    } else {
        SessionStatus::Closing
    }
}

fn transition(session: &mut SessionState, next: SessionStatus) {
    if session.status == next {
        return;
    }
    if session.status.can_transition_to(next) {
        debug!(
            session_id = %session.session_id,
            from = %session.status,
            to = %next,
            "Session status changed"
        );
        session.status = next;
    } else {
        warn!(
            session_id = %session.session_id,
            from = %session.status,
            to = %next,
            "Rejected session status change"
        );
    }
}

fn retain_and_emit(
    session: &mut SessionState,
    message: SessionMessageBody,
    now: DateTime<Utc>,
) -> OutboundRecord {
    if let Some(seq) = message.seq() {
        session.unacked.insert(
            seq,
            UnackedMessage {
                message: message.clone(),
                sent_at: now,
            },
        );
    }
    OutboundRecord::session(session.session_id.clone(), session.counterparty.clone(), message)
}

fn mark_errored(session: &mut SessionState, error: FlowError) {
    transition(session, SessionStatus::Errored);
    session.error = Some(error);
    session.unacked.clear();
    session.out_of_order_buffer.clear();
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use serde_json::json;

    fn manager() -> SessionManager {
        SessionManager::new(Duration::seconds(30))
    }

    fn open_session() -> SessionState {
        let mut session = SessionState::initiated(SessionId::from("s1"), Counterparty::from("bob"));
        session.status = SessionStatus::Confirmed;
        session
    }

    fn acks(records: &[OutboundRecord]) -> Vec<u64> {
        records
            .iter()
            .filter_map(|r| match r {
                OutboundRecord::Session(m) => match m.message {
                    SessionMessageBody::Ack { received_seq } => Some(received_seq),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_in_order_delivery_acks() {
        let mut session = open_session();
        let update = manager().on_data(&mut session, 1, json!("a"));
        assert_eq!(update.outcome, DataOutcome::Delivered);
        assert_eq!(acks(&update.records), vec![2]);
        assert_eq!(session.next_expected_recv_seq, 2);
        assert_eq!(session.received.front(), Some(&json!("a")));
    }

    #[test]
    fn test_gap_is_buffered_without_ack() {
        let mut session = open_session();
        let update = manager().on_data(&mut session, 3, json!("c"));
        assert_eq!(update.outcome, DataOutcome::Buffered);
        assert!(update.records.is_empty());
        assert_eq!(session.next_expected_recv_seq, 1);
        assert!(session.received.is_empty());
    }

    #[test]
    fn test_filling_gap_drains_buffer_with_one_ack() {
        let mut session = open_session();
        let m = manager();
        m.on_data(&mut session, 3, json!("c"));
        m.on_data(&mut session, 2, json!("b"));
        let update = m.on_data(&mut session, 1, json!("a"));

        assert_eq!(update.outcome, DataOutcome::Delivered);
        assert_eq!(acks(&update.records), vec![4]);
        assert_eq!(session.next_expected_recv_seq, 4);
        assert_eq!(
            session.received.iter().cloned().collect::<Vec<_>>(),
            vec![json!("a"), json!("b"), json!("c")]
        );
        assert!(session.out_of_order_buffer.is_empty());
    }

    #[test]
    fn test_duplicate_is_discarded() {
        let mut session = open_session();
        let m = manager();
        m.on_data(&mut session, 1, json!("a"));
        let before = session.clone();
        let update = m.on_data(&mut session, 1, json!("a"));
        assert_eq!(update.outcome, DataOutcome::Duplicate);
        assert!(update.records.is_empty());
        assert_eq!(session, before);
    }

    #[test]
    fn test_message_beyond_lookahead_is_refused() {
        let mut session = open_session();
        let m = manager().with_max_lookahead(4);

        assert_eq!(m.on_data(&mut session, 5, json!("e")).outcome, DataOutcome::Buffered);
        let update = m.on_data(&mut session, 6, json!("f"));
        assert_eq!(update.outcome, DataOutcome::OutOfRange);
        assert!(update.records.is_empty());
        assert_eq!(
            m.on_data(&mut session, u64::MAX, json!("z")).outcome,
            DataOutcome::OutOfRange
        );
        assert_eq!(session.out_of_order_buffer.keys().copied().collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn test_duplicate_of_buffered_is_discarded() {
        let mut session = open_session();
        let m = manager();
        m.on_data(&mut session, 2, json!("b"));
        let update = m.on_data(&mut session, 2, json!("b"));
        assert_eq!(update.outcome, DataOutcome::Duplicate);
    }

    #[test]
    fn test_out_of_order_close_waits_for_data() {
        let mut session = open_session();
        let m = manager();

        let update = m.on_close(&mut session, 2);
        assert_eq!(update.outcome, DataOutcome::Buffered);
        assert!(!session.close_received);

        let update = m.on_data(&mut session, 1, json!("last"));
        assert_eq!(update.outcome, DataOutcome::Delivered);
        assert_eq!(acks(&update.records), vec![3]);
        assert!(session.close_received);
        assert_eq!(session.status, SessionStatus::Closing);
        assert!(!update.terminated);
    }

    #[test]
    fn test_close_after_our_close_terminates() {
        let mut session = open_session();
        let m = manager();
        let now = DateTime::<Utc>::UNIX_EPOCH;
        m.close(&mut session, now).unwrap();
        assert_eq!(session.status, SessionStatus::Closing);

        let update = m.on_close(&mut session, 1);
        assert!(update.terminated);
        assert_eq!(session.status, SessionStatus::Closed);
    }

    #[test]
    fn test_data_after_peer_close_is_ignored() {
        let mut session = open_session();
        let m = manager();
        m.on_close(&mut session, 1);
        let update = m.on_data(&mut session, 2, json!("late"));
        assert_eq!(update.outcome, DataOutcome::Ignored);
        assert!(session.received.is_empty());
    }

    #[test]
    fn test_ack_confirms_and_releases_unacked() {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        let m = manager();
        let mut sessions = BTreeMap::new();
        let initiation = SessionInitiation {
            session_id: SessionId::from("s1"),
            counterparty: Counterparty::from("bob"),
            protocol: "ping".to_string(),
        };
        m.create_session(&mut sessions, &initiation, now).unwrap();
        let session = sessions.get_mut(&SessionId::from("s1")).unwrap();
        m.send(session, json!(1), now).unwrap();
        assert_eq!(session.unacked.len(), 2);

        let update = m.on_ack(session, 1);
        assert_eq!(update.outcome, AckOutcome::Advanced);
        assert_eq!(session.status, SessionStatus::Confirmed);
        assert_eq!(session.unacked.keys().copied().collect::<Vec<_>>(), vec![1]);

        assert_eq!(m.on_ack(session, 1).outcome, AckOutcome::Duplicate);
        assert_eq!(m.on_ack(session, 5).outcome, AckOutcome::Invalid);
        assert_eq!(m.on_ack(session, 2).outcome, AckOutcome::Advanced);
        assert!(session.unacked.is_empty());
    }

    #[test]
    fn test_create_session_twice_fails() {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        let m = manager();
        let mut sessions = BTreeMap::new();
        let initiation = SessionInitiation {
            session_id: SessionId::from("s1"),
            counterparty: Counterparty::from("bob"),
            protocol: "ping".to_string(),
        };
        assert!(m.create_session(&mut sessions, &initiation, now).is_ok());
        assert!(m.create_session(&mut sessions, &initiation, now).is_err());
    }

    #[test]
    fn test_receive_satisfaction_needs_every_session() {
        let m = manager();
        let mut sessions = BTreeMap::new();
        sessions.insert(SessionId::from("s1"), open_session());
        let mut other = open_session();
        other.session_id = SessionId::from("s2");
        sessions.insert(SessionId::from("s2"), other);
        let wanted: BTreeSet<_> = [SessionId::from("s1"), SessionId::from("s2")].into();

        m.on_data(sessions.get_mut(&SessionId::from("s1")).unwrap(), 1, json!(1));
        assert!(!m.is_receive_satisfied(&sessions, &wanted));

        m.on_error(
            sessions.get_mut(&SessionId::from("s2")).unwrap(),
            FlowError::platform("gone"),
        );
        assert!(m.is_receive_satisfied(&sessions, &wanted));

        let taken = m.take_received(&mut sessions, &wanted);
        assert_eq!(taken, Err(FlowError::platform("gone")));
        // nothing consumed on error
        assert_eq!(sessions[&SessionId::from("s1")].received.len(), 1);
    }

    #[test]
    fn test_errored_session_satisfies_receive_without_other_data() {
        let m = manager();
        let mut sessions = BTreeMap::new();
        sessions.insert(SessionId::from("s1"), open_session());
        let mut other = open_session();
        other.session_id = SessionId::from("s2");
        sessions.insert(SessionId::from("s2"), other);
        let wanted: BTreeSet<_> = [SessionId::from("s1"), SessionId::from("s2")].into();
        assert!(!m.is_receive_satisfied(&sessions, &wanted));

        m.on_error(
            sessions.get_mut(&SessionId::from("s2")).unwrap(),
            FlowError::platform("peer crashed"),
        );
        assert!(sessions[&SessionId::from("s1")].received.is_empty());
        assert!(m.is_receive_satisfied(&sessions, &wanted));
        assert_eq!(
            m.take_received(&mut sessions, &wanted),
            Err(FlowError::platform("peer crashed"))
        );
    }

    #[test]
    fn test_take_received_after_peer_close_is_error() {
        let m = manager();
        let mut sessions = BTreeMap::new();
        sessions.insert(SessionId::from("s1"), open_session());
        let wanted: BTreeSet<_> = [SessionId::from("s1")].into();

        m.on_close(sessions.get_mut(&SessionId::from("s1")).unwrap(), 1);
        assert!(m.is_receive_satisfied(&sessions, &wanted));
        let taken = m.take_received(&mut sessions, &wanted);
        assert!(matches!(taken, Err(e) if e.message.contains("closed by counterparty")));
    }

    #[test]
    fn test_error_session_is_idempotent() {
        let m = manager();
        let mut session = open_session();
        let error = FlowError::platform("flow failed");
        let first = m.error_session(&mut session, &error);
        assert!(first.terminated);
        assert_eq!(first.records.len(), 1);
        let second = m.error_session(&mut session, &error);
        assert!(!second.terminated);
        assert!(second.records.is_empty());
        assert_eq!(m.on_error(&mut session, error).outcome, ErrorOutcome::AlreadyTerminal);
    }

    #[test]
    fn test_send_on_closed_session_fails() {
        let m = manager();
        let now = DateTime::<Utc>::UNIX_EPOCH;
        let mut session = open_session();
        m.close(&mut session, now).unwrap();
        assert!(m.send(&mut session, json!(1), now).is_err());
    }

    #[test]
    fn test_resend_respects_window() {
        let m = manager();
        let start = DateTime::<Utc>::UNIX_EPOCH;
        let mut session = open_session();
        m.send(&mut session, json!("x"), start).unwrap();

        assert!(m.resend_unacked(&mut session, start + Duration::seconds(10)).is_empty());
        let resent = m.resend_unacked(&mut session, start + Duration::seconds(30));
        assert_eq!(resent.len(), 1);
        // the resend restarts the window
        assert!(m.resend_unacked(&mut session, start + Duration::seconds(31)).is_empty());
    }
}
