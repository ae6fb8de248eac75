//! Continuation dispatcher.
//!
//! The top-level state machine. For every inbound event it loads the flow's
//! checkpoint, applies the event through the session manager or the external
//! event correlator, resumes flow logic if the current wait is now fully
//! satisfied, and commits the new checkpoint together with every outbound
//! record in one store write.
//!
//! Replays are detected from state already in the checkpoint (sequence
//! numbers, acknowledgement watermarks, pending request ids, wakeup tokens)
//! or from the terminal status the store remembers, never from wall-clock
//! deduplication. A replayed event commits nothing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore, CheckpointWrite, Commit, FlowStatus};
use crate::classify::{self, FlowError};
use crate::cleanup::CleanupScheduler;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::external::{CorrelationOutcome, ExternalEventCorrelator};
use crate::flow::{FlowContext, FlowLogic, FlowOutcome, FlowRegistry, Resumed};
use crate::message::{
    FlowStatusRecord, InboundBody, InboundEvent, OutboundRecord, SessionMessageBody,
};
use crate::session::{AckOutcome, DataOutcome, ErrorOutcome, SessionManager, SessionUpdate};
use crate::types::{Counterparty, FlowId, Payload, RequestId, SessionId};

/// An inbound event that could not be applied consistently.
///
/// Anomalies never change the checkpoint and never emit records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// No checkpoint and no terminal status for the flow.
    UnknownFlow,
    /// The flow has no session with this id.
    UnknownSession { session_id: SessionId },
    /// A second peer tried to open a session into a running flow.
    UnexpectedSessionInit { session_id: SessionId },
    /// Sequenced message after the peer closed or the session ended.
    DataAfterClose { session_id: SessionId, seq: u64 },
    /// Sequenced message too far ahead of the expected sequence number.
    SequenceOutOfRange { session_id: SessionId, seq: u64 },
    /// Acknowledgement of a sequence number never sent.
    InvalidAck {
        session_id: SessionId,
        received_seq: u64,
    },
    /// Response for an unknown or superseded external request.
    StaleResponse { request_id: RequestId },
    /// Event for a flow parked after a Fatal failure.
    DeadLettered,
}

/// What processing one inbound event did.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub flow_id: FlowId,
    /// Whether anything was committed.
    pub applied: bool,
    /// Records committed with the checkpoint, in emission order.
    pub records: Vec<OutboundRecord>,
    pub anomalies: Vec<Anomaly>,
    /// Flow status after processing, if the flow is known.
    pub status: Option<FlowStatus>,
}

enum Terminal {
    Completed(Payload),
    Failed(FlowError),
    Killed(FlowError),
}

enum Applied {
    /// State changed; the wait may now be satisfied.
    Resumable(Vec<OutboundRecord>),
    /// State changed without affecting the wait.
    Persist(Vec<OutboundRecord>),
    /// Replay; nothing to do.
    Unchanged,
    Rejected(Anomaly),
}

#[derive(Default)]
struct Step {
    write: Option<CheckpointWrite>,
    records: Vec<OutboundRecord>,
    terminal_status: Option<FlowStatus>,
    anomalies: Vec<Anomaly>,
    status: Option<FlowStatus>,
}

impl Step {
    fn unchanged(status: Option<FlowStatus>) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    fn rejected(anomaly: Anomaly, status: Option<FlowStatus>) -> Self {
        Self {
            anomalies: vec![anomaly],
            status,
            ..Self::default()
        }
    }

    fn persist(cp: Checkpoint, records: Vec<OutboundRecord>) -> Self {
        Self {
            status: Some(cp.status),
            write: Some(CheckpointWrite::Put(Box::new(cp))),
            records,
            ..Self::default()
        }
    }

    fn has_effects(&self) -> bool {
        self.write.is_some() || !self.records.is_empty() || self.terminal_status.is_some()
    }
}

/// Consumes inbound events and drives flows between suspension points.
pub struct ContinuationDispatcher {
    store: Arc<dyn CheckpointStore>,
    registry: Arc<FlowRegistry>,
    clock: Arc<dyn Clock>,
    pub(crate) sessions: SessionManager,
    pub(crate) external: ExternalEventCorrelator,
    pub(crate) cleanup: CleanupScheduler,
}

impl ContinuationDispatcher {
    /// Assemble a dispatcher from its collaborators.
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        registry: Arc<FlowRegistry>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            sessions: SessionManager::new(config.session_resend_window())
                .with_max_lookahead(config.session_max_lookahead),
            external: ExternalEventCorrelator::new(
                config.external_resend_window(),
                config.max_external_retries,
                config.default_external_ttl_seconds,
            ),
            cleanup: CleanupScheduler::new(),
        }
    }

    /// The checkpoint store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// The flow registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    /// Process one inbound event.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be loaded or the commit
    /// fails. Nothing is visible in that case and the event may be
    /// redelivered.
    pub async fn process(&self, event: InboundEvent) -> Result<DispatchOutcome> {
        let now = self.clock.now();
        let InboundEvent { flow_id, body } = event;
        debug!(flow_id = %flow_id, event = body.name(), "Processing event");

        let step = match self.store.get(&flow_id).await? {
            Some(cp) => self.with_checkpoint(cp, body, now),
            None => self.without_checkpoint(&flow_id, body, now).await?,
        };

        let applied = step.has_effects();
        if applied {
            let commit = Commit {
                flow_id: flow_id.clone(),
                write: step.write.unwrap_or(CheckpointWrite::Keep),
                records: step.records.clone(),
                terminal_status: step.terminal_status,
            };
            if let Err(e) = self.store.commit(commit).await {
                error!(flow_id = %flow_id, error = %e, "Checkpoint commit failed");
                return Err(e);
            }
        }

        Ok(DispatchOutcome {
            flow_id,
            applied,
            records: step.records,
            anomalies: step.anomalies,
            status: step.status,
        })
    }

    async fn without_checkpoint(
        &self,
        flow_id: &FlowId,
        body: InboundBody,
        now: DateTime<Utc>,
    ) -> Result<Step> {
        let terminal = self.store.terminal_status(flow_id).await?;
        if let Some(status) = terminal {
            debug!(flow_id = %flow_id, status = %status, "Event for a terminated flow");
            return Ok(Step::unchanged(Some(status)));
        }

        Ok(match body {
            InboundBody::StartFlow { flow_name, args } => {
                self.start_flow(flow_id, &flow_name, Resumed::Start { args }, Vec::new(), now)
            }
            InboundBody::SessionInit {
                session_id,
                counterparty,
                protocol,
            } => self.start_responder(flow_id, session_id, counterparty, &protocol, now),
            other => {
                warn!(flow_id = %flow_id, event = other.name(), "Event for an unknown flow");
                Step::rejected(Anomaly::UnknownFlow, None)
            }
        })
    }

    fn start_flow(
        &self,
        flow_id: &FlowId,
        flow_name: &str,
        resumed: Resumed,
        mut records: Vec<OutboundRecord>,
        now: DateTime<Utc>,
    ) -> Step {
        let Some(logic) = self.registry.get(flow_name) else {
            let error = FlowError::unsupported(format!("no flow registered under '{flow_name}'"));
            warn!(flow_id = %flow_id, flow_name, "Start of an unregistered flow");
            return self.terminal_without_checkpoint(flow_id, FlowStatus::Failed, &error, records);
        };
        if self.registry.is_disabled(flow_name) {
            let error = FlowError::platform(format!("flow '{flow_name}' is disabled"));
            info!(flow_id = %flow_id, flow_name, "Start of a disabled flow");
            return self.terminal_without_checkpoint(flow_id, FlowStatus::Killed, &error, records);
        }

        let mut cp = Checkpoint::initial(flow_id.clone(), flow_name, now);
        if let Resumed::Initiated {
            session_id,
            counterparty,
        } = &resumed
        {
            match self
                .sessions
                .accept_session(&mut cp.sessions, session_id.clone(), counterparty.clone())
            {
                Ok(ack) => records.extend(ack),
                Err(error) => {
                    return self.terminal_without_checkpoint(
                        flow_id,
                        FlowStatus::Failed,
                        &error,
                        records,
                    )
                }
            }
        }
        records.push(OutboundRecord::FlowStatus(FlowStatusRecord::running(
            flow_id.clone(),
        )));
        info!(flow_id = %flow_id, flow_name, "Flow started");

        match self.run(&mut cp, logic.as_ref(), resumed, now, &mut records) {
            Some(terminal) => self.terminate(cp, terminal, records),
            None => Step::persist(cp, records),
        }
    }

    fn start_responder(
        &self,
        flow_id: &FlowId,
        session_id: SessionId,
        counterparty: Counterparty,
        protocol: &str,
        now: DateTime<Utc>,
    ) -> Step {
        let refusal = if !self.registry.has(protocol) {
            Some((
                FlowStatus::Failed,
                FlowError::unsupported(format!("no flow registered under '{protocol}'")),
            ))
        } else if self.registry.is_disabled(protocol) {
            Some((
                FlowStatus::Killed,
                FlowError::platform(format!("flow '{protocol}' is disabled")),
            ))
        } else {
            None
        };

        if let Some((status, error)) = refusal {
            warn!(
                flow_id = %flow_id,
                session_id = %session_id,
                protocol,
                status = %status,
                "Session init refused"
            );
            let mut records = vec![OutboundRecord::session(
                session_id.clone(),
                counterparty,
                SessionMessageBody::Error {
                    error: error.to_envelope(),
                },
            )];
            records.extend(self.cleanup.schedule_cleanup(flow_id, [&session_id]));
            return self.terminal_without_checkpoint(flow_id, status, &error, records);
        }

        self.start_flow(
            flow_id,
            protocol,
            Resumed::Initiated {
                session_id,
                counterparty,
            },
            Vec::new(),
            now,
        )
    }

    fn terminal_without_checkpoint(
        &self,
        flow_id: &FlowId,
        status: FlowStatus,
        error: &FlowError,
        mut records: Vec<OutboundRecord>,
    ) -> Step {
        records.push(OutboundRecord::FlowStatus(FlowStatusRecord::with_error(
            flow_id.clone(),
            status,
            error,
        )));
        Step {
            records,
            terminal_status: Some(status),
            status: Some(status),
            ..Step::default()
        }
    }

    fn with_checkpoint(&self, mut cp: Checkpoint, body: InboundBody, now: DateTime<Utc>) -> Step {
        if let InboundBody::KillFlow { reason } = &body {
            let error = FlowError::platform(format!("flow killed: {reason}"));
            return self.terminate(cp, Terminal::Killed(error), Vec::new());
        }
        if self.registry.is_disabled(&cp.flow_name) {
            let error = FlowError::platform(format!("flow '{}' is disabled", cp.flow_name));
            return self.terminate(cp, Terminal::Killed(error), Vec::new());
        }
        if cp.dead_letter.is_some() {
            warn!(flow_id = %cp.flow_id, event = body.name(), "Event for a dead-lettered flow");
            return Step::rejected(Anomaly::DeadLettered, Some(cp.status));
        }

        let flow_id = cp.flow_id.clone();
        let applied = match body {
            InboundBody::StartFlow { .. } => {
                debug!(flow_id = %flow_id, "Duplicate start");
                Applied::Unchanged
            }
            InboundBody::SessionInit { session_id, .. } => {
                if cp.sessions.contains_key(&session_id) {
                    debug!(flow_id = %flow_id, session_id = %session_id, "Duplicate session init");
                    Applied::Unchanged
                } else {
                    warn!(flow_id = %flow_id, session_id = %session_id, "Session init for a running flow");
                    Applied::Rejected(Anomaly::UnexpectedSessionInit { session_id })
                }
            }
            InboundBody::SessionData {
                session_id,
                seq,
                payload,
            } => match cp.sessions.get_mut(&session_id) {
                Some(session) => {
                    let update = self.sessions.on_data(session, seq, payload);
                    self.sequenced(&flow_id, session_id, seq, update)
                }
                None => unknown_session(&flow_id, session_id),
            },
            InboundBody::SessionClose { session_id, seq } => match cp.sessions.get_mut(&session_id) {
                Some(session) => {
                    let update = self.sessions.on_close(session, seq);
                    self.sequenced(&flow_id, session_id, seq, update)
                }
                None => unknown_session(&flow_id, session_id),
            },
            InboundBody::SessionAck {
                session_id,
                received_seq,
            } => match cp.sessions.get_mut(&session_id) {
                Some(session) => match self.sessions.on_ack(session, received_seq).outcome {
                    AckOutcome::Advanced => Applied::Resumable(Vec::new()),
                    AckOutcome::Duplicate => Applied::Unchanged,
                    AckOutcome::Invalid => Applied::Rejected(Anomaly::InvalidAck {
                        session_id,
                        received_seq,
                    }),
                },
                None => unknown_session(&flow_id, session_id),
            },
            InboundBody::SessionError { session_id, error } => {
                match cp.sessions.get_mut(&session_id) {
                    Some(session) => {
                        let error = classify::classify_session_error(&error);
                        let update = self.sessions.on_error(session, error);
                        match update.outcome {
                            ErrorOutcome::Errored => Applied::Resumable(
                                self.cleanup.schedule_cleanup(&flow_id, [&session_id]),
                            ),
                            ErrorOutcome::AlreadyTerminal => Applied::Unchanged,
                        }
                    }
                    None => unknown_session(&flow_id, session_id),
                }
            }
            InboundBody::ExternalEventResponse {
                request_id,
                attempt,
                result,
            } => {
                let outcome = self.external.on_response(
                    &flow_id,
                    &mut cp.pending_external_events,
                    &cp.completed_requests,
                    &request_id,
                    attempt,
                    result,
                    now,
                );
                match outcome {
                    CorrelationOutcome::Resolved => Applied::Resumable(Vec::new()),
                    CorrelationOutcome::Retrying { resend } => {
                        Applied::Persist(resend.into_iter().collect())
                    }
                    CorrelationOutcome::DeadLetter(error) => return self.dead_letter(cp, error),
                    CorrelationOutcome::Duplicate => Applied::Unchanged,
                    CorrelationOutcome::Stale => {
                        Applied::Rejected(Anomaly::StaleResponse { request_id })
                    }
                }
            }
            InboundBody::Wakeup { token: Some(token) } => {
                if cp.pending_wakeup == Some(token) {
                    cp.pending_wakeup = None;
                    Applied::Resumable(Vec::new())
                } else {
                    debug!(flow_id = %flow_id, token, "Stale wakeup");
                    Applied::Unchanged
                }
            }
            InboundBody::Wakeup { token: None } => {
                let records = self.tick(&mut cp, now);
                if records.is_empty() {
                    Applied::Unchanged
                } else {
                    Applied::Persist(records)
                }
            }
            InboundBody::KillFlow { .. } => Applied::Unchanged,
        };

        match applied {
            Applied::Unchanged => Step::unchanged(Some(cp.status)),
            Applied::Rejected(anomaly) => Step::rejected(anomaly, Some(cp.status)),
            Applied::Persist(records) => Step::persist(cp, records),
            Applied::Resumable(mut records) => match self.try_resume(&mut cp, now, &mut records) {
                Some(terminal) => self.terminate(cp, terminal, records),
                None => Step::persist(cp, records),
            },
        }
    }

    fn sequenced(
        &self,
        flow_id: &FlowId,
        session_id: SessionId,
        seq: u64,
        update: SessionUpdate<DataOutcome>,
    ) -> Applied {
        match update.outcome {
            DataOutcome::Delivered | DataOutcome::Buffered => {
                let mut records = update.records;
                if update.terminated {
                    records.extend(self.cleanup.schedule_cleanup(flow_id, [&session_id]));
                }
                Applied::Resumable(records)
            }
            DataOutcome::Duplicate => Applied::Unchanged,
            DataOutcome::Ignored => Applied::Rejected(Anomaly::DataAfterClose { session_id, seq }),
            DataOutcome::OutOfRange => {
                Applied::Rejected(Anomaly::SequenceOutOfRange { session_id, seq })
            }
        }
    }

    /// Resend whatever is due; never resumes flow logic.
    fn tick(&self, cp: &mut Checkpoint, now: DateTime<Utc>) -> Vec<OutboundRecord> {
        let mut records = self
            .external
            .retry_due(&cp.flow_id, &mut cp.pending_external_events, now);
        for session in cp.sessions.values_mut() {
            records.extend(self.sessions.resend_unacked(session, now));
        }
        records
    }

    fn try_resume(
        &self,
        cp: &mut Checkpoint,
        now: DateTime<Utc>,
        records: &mut Vec<OutboundRecord>,
    ) -> Option<Terminal> {
        // a wait satisfied at suspension resumes only on its own wakeup token
        if cp.pending_wakeup.is_some() || !self.is_satisfied(cp) {
            return None;
        }
        let Some(logic) = self.registry.get(&cp.flow_name) else {
            return Some(Terminal::Failed(FlowError::unsupported(format!(
                "no flow registered under '{}'",
                cp.flow_name
            ))));
        };
        let resumed = self.take_resolution(cp);
        cp.waiting_on = None;
        debug!(flow_id = %cp.flow_id, "Flow resumed");
        self.run(cp, logic.as_ref(), resumed, now, records)
    }

    /// Run flow logic to its next suspension point.
    fn run(
        &self,
        cp: &mut Checkpoint,
        logic: &dyn FlowLogic,
        resumed: Resumed,
        now: DateTime<Utc>,
        records: &mut Vec<OutboundRecord>,
    ) -> Option<Terminal> {
        let outcome = {
            let mut ctx = FlowContext::new(
                &cp.flow_id,
                &mut cp.flow_state,
                &mut cp.next_session_ordinal,
                &mut cp.next_request_ordinal,
            );
            logic.resume(&mut ctx, resumed)
        };

        match outcome {
            Ok(FlowOutcome::Suspend(request)) => {
                info!(flow_id = %cp.flow_id, request = request.name(), "Flow suspended");
                let setup = self.begin_wait(cp, request, now);
                records.extend(setup);
                if self.is_satisfied(cp) {
                    let token = cp.allocate_wakeup_token();
                    records.push(OutboundRecord::Wakeup {
                        flow_id: cp.flow_id.clone(),
                        token: Some(token),
                    });
                }
                None
            }
            Ok(FlowOutcome::Finish(result)) => Some(Terminal::Completed(result)),
            Ok(FlowOutcome::Fail(error)) | Err(error) => {
                Some(Terminal::Failed(classify::classify_flow_logic_error(error)))
            }
        }
    }

    /// Delete the checkpoint, error and clean up every session not CLOSED,
    /// and publish the terminal status.
    fn terminate(&self, mut cp: Checkpoint, terminal: Terminal, mut records: Vec<OutboundRecord>) -> Step {
        let (status, status_record, session_error) = match terminal {
            Terminal::Completed(result) => (
                FlowStatus::Completed,
                FlowStatusRecord::completed(cp.flow_id.clone(), result),
                FlowError::platform(format!(
                    "flow '{}' completed with the session still open",
                    cp.flow_id
                )),
            ),
            Terminal::Failed(error) => (
                FlowStatus::Failed,
                FlowStatusRecord::with_error(cp.flow_id.clone(), FlowStatus::Failed, &error),
                error,
            ),
            Terminal::Killed(error) => (
                FlowStatus::Killed,
                FlowStatusRecord::with_error(cp.flow_id.clone(), FlowStatus::Killed, &error),
                error,
            ),
        };

        let unclosed = cp.unclosed_sessions();
        for id in &unclosed {
            if let Some(session) = cp.sessions.get_mut(id) {
                records.extend(self.sessions.error_session(session, &session_error).records);
            }
        }
        records.extend(self.cleanup.schedule_cleanup(&cp.flow_id, &unclosed));
        records.push(OutboundRecord::FlowStatus(status_record));

        match status {
            FlowStatus::Failed | FlowStatus::Killed => {
                warn!(flow_id = %cp.flow_id, status = %status, error = %session_error, "Flow terminated");
            }
            _ => info!(flow_id = %cp.flow_id, status = %status, "Flow terminated"),
        }

        Step {
            write: Some(CheckpointWrite::Delete),
            records,
            terminal_status: Some(status),
            anomalies: Vec::new(),
            status: Some(status),
        }
    }

    /// Park the flow after a Fatal failure.
    ///
    /// The checkpoint stays with its wait unchanged; open sessions are errored
    /// and cleaned up; the flow never resumes. Only a kill removes it.
    fn dead_letter(&self, mut cp: Checkpoint, error: FlowError) -> Step {
        error!(flow_id = %cp.flow_id, error = %error, "Flow dead-lettered");
        let mut records = vec![OutboundRecord::DeadLetter {
            flow_id: cp.flow_id.clone(),
            error: error.clone(),
        }];
        let mut errored = Vec::new();
        for session in cp.sessions.values_mut() {
            let update = self.sessions.error_session(session, &error);
            if update.terminated {
                errored.push(session.session_id.clone());
            }
            records.extend(update.records);
        }
        if !errored.is_empty() {
            records.extend(self.cleanup.schedule_cleanup(&cp.flow_id, &errored));
        }
        cp.dead_letter = Some(error);
        Step::persist(cp, records)
    }
}

fn unknown_session(flow_id: &FlowId, session_id: SessionId) -> Applied {
    warn!(flow_id = %flow_id, session_id = %session_id, "Event for an unknown session");
    Applied::Rejected(Anomaly::UnknownSession { session_id })
}
