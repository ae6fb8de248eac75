//! Setting up, evaluating and resolving the wait a flow suspends on.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::checkpoint::Checkpoint;
use crate::classify::FlowError;
use crate::dispatcher::ContinuationDispatcher;
use crate::external::{ExternalEventState, ExternalResolution};
use crate::flow::Resumed;
use crate::io::FlowIORequest;
use crate::message::OutboundRecord;
use crate::session::SessionState;
use crate::types::{FlowId, RequestId, SessionId};

struct WaitSetup {
    records: Vec<OutboundRecord>,
    terminated: Vec<SessionId>,
}

impl ContinuationDispatcher {
    /// Perform the side effects of a new wait and store it in the checkpoint.
    ///
    /// Setup is all-or-nothing: if any part fails, no session or pending call
    /// changes, and the failure is kept as the wait's resolution.
    pub(crate) fn begin_wait(
        &self,
        cp: &mut Checkpoint,
        request: FlowIORequest,
        now: DateTime<Utc>,
    ) -> Vec<OutboundRecord> {
        cp.wait_error = None;
        let mut sessions = cp.sessions.clone();
        let mut pending = cp.pending_external_events.clone();

        let records =
            match self.setup_wait(&cp.flow_id, &mut sessions, &mut pending, &request, now) {
                Ok(setup) => {
                    cp.sessions = sessions;
                    cp.pending_external_events = pending;
                    let mut records = setup.records;
                    if !setup.terminated.is_empty() {
                        records.extend(
                            self.cleanup
                                .schedule_cleanup(&cp.flow_id, &setup.terminated),
                        );
                    }
                    records
                }
                Err(error) => {
                    tracing::debug!(
                        flow_id = %cp.flow_id,
                        request = request.name(),
                        error = %error,
                        "Wait setup failed"
                    );
                    cp.wait_error = Some(error);
                    Vec::new()
                }
            };
        cp.waiting_on = Some(request);
        records
    }

    fn setup_wait(
        &self,
        flow_id: &FlowId,
        sessions: &mut BTreeMap<SessionId, SessionState>,
        pending: &mut BTreeMap<RequestId, ExternalEventState>,
        request: &FlowIORequest,
        now: DateTime<Utc>,
    ) -> Result<WaitSetup, FlowError> {
        let mut setup = WaitSetup {
            records: Vec::new(),
            terminated: Vec::new(),
        };
        match request {
            FlowIORequest::Send { payloads } | FlowIORequest::SendAndReceive { payloads } => {
                for (id, payload) in payloads {
                    let session = existing(sessions, id)?;
                    setup
                        .records
                        .extend(self.sessions.send(session, payload.clone(), now)?);
                }
            }
            FlowIORequest::Receive { sessions: wanted } => {
                for id in wanted {
                    existing(sessions, id)?;
                }
            }
            FlowIORequest::InitiateSession { sessions: wanted } => {
                for initiation in wanted {
                    setup
                        .records
                        .extend(self.sessions.create_session(sessions, initiation, now)?);
                }
            }
            FlowIORequest::CloseSessions { sessions: wanted } => {
                for id in wanted {
                    let update = self.sessions.close(existing(sessions, id)?, now)?;
                    setup.records.extend(update.records);
                    if update.terminated {
                        setup.terminated.push(id.clone());
                    }
                }
            }
            FlowIORequest::ExternalEvent {
                request_id,
                factory,
                input,
                ttl_seconds,
            } => {
                setup.records.push(self.external.send(
                    pending,
                    flow_id,
                    request_id.clone(),
                    factory.clone(),
                    input.clone(),
                    *ttl_seconds,
                    now,
                )?);
            }
            FlowIORequest::SubFlowFinished { sessions: wanted } => {
                for id in wanted {
                    let Some(session) = sessions.get_mut(id) else {
                        continue;
                    };
                    if session.is_terminal() {
                        continue;
                    }
                    let update = self.sessions.close(session, now)?;
                    setup.records.extend(update.records);
                    if update.terminated {
                        setup.terminated.push(id.clone());
                    }
                }
            }
            FlowIORequest::SubFlowFailed {
                sessions: wanted,
                error,
            } => {
                for id in wanted {
                    let Some(session) = sessions.get_mut(id) else {
                        continue;
                    };
                    let update = self.sessions.error_session(session, error);
                    setup.records.extend(update.records);
                    if update.terminated {
                        setup.terminated.push(id.clone());
                    }
                }
            }
            FlowIORequest::Wakeup => {}
        }
        Ok(setup)
    }

    /// Check if the wait stored in the checkpoint is fully satisfied.
    pub(crate) fn is_satisfied(&self, cp: &Checkpoint) -> bool {
        if cp.wait_error.is_some() {
            return true;
        }
        let Some(request) = &cp.waiting_on else {
            return false;
        };
        match request {
            FlowIORequest::Send { .. } | FlowIORequest::InitiateSession { .. } => request
                .sessions()
                .iter()
                .all(|id| cp.sessions.get(id).is_none_or(SessionState::is_confirmed)),
            FlowIORequest::Receive { .. } | FlowIORequest::SendAndReceive { .. } => self
                .sessions
                .is_receive_satisfied(&cp.sessions, &request.sessions()),
            FlowIORequest::CloseSessions { sessions } | FlowIORequest::SubFlowFinished { sessions } => {
                sessions
                    .iter()
                    .all(|id| cp.sessions.get(id).is_none_or(SessionState::is_terminal))
            }
            FlowIORequest::ExternalEvent { request_id, .. } => cp
                .pending_external_events
                .get(request_id)
                .is_some_and(|state| state.resolution.is_some()),
            FlowIORequest::SubFlowFailed { .. } | FlowIORequest::Wakeup => true,
        }
    }

    /// Consume what the satisfied wait produced.
    pub(crate) fn take_resolution(&self, cp: &mut Checkpoint) -> Resumed {
        if let Some(error) = cp.wait_error.take() {
            return Resumed::Error { error };
        }
        let Some(request) = cp.waiting_on.clone() else {
            return Resumed::Continue;
        };
        match request {
            FlowIORequest::Send { .. }
            | FlowIORequest::InitiateSession { .. }
            | FlowIORequest::CloseSessions { .. } => {
                match first_failure(&cp.sessions, &request.sessions()) {
                    Some(error) => Resumed::Error { error },
                    None => Resumed::Continue,
                }
            }
            FlowIORequest::Receive { .. } | FlowIORequest::SendAndReceive { .. } => {
                match self
                    .sessions
                    .take_received(&mut cp.sessions, &request.sessions())
                {
                    Ok(payloads) => Resumed::Received { payloads },
                    Err(error) => Resumed::Error { error },
                }
            }
            FlowIORequest::ExternalEvent { request_id, .. } => {
                let state = cp.pending_external_events.remove(&request_id);
                cp.completed_requests.insert(request_id.clone());
                match state.and_then(|s| s.resolution) {
                    Some(ExternalResolution::Completed { payload }) => {
                        Resumed::ExternalEvent { payload }
                    }
                    Some(ExternalResolution::Failed { error }) => Resumed::Error { error },
                    None => Resumed::Error {
                        error: FlowError::platform(format!(
                            "external request '{request_id}' has no resolution"
                        )),
                    },
                }
            }
            FlowIORequest::SubFlowFinished { .. }
            | FlowIORequest::SubFlowFailed { .. }
            | FlowIORequest::Wakeup => Resumed::Continue,
        }
    }
}

fn existing<'a>(
    sessions: &'a mut BTreeMap<SessionId, SessionState>,
    id: &SessionId,
) -> Result<&'a mut SessionState, FlowError> {
    sessions
        .get_mut(id)
        .ok_or_else(|| FlowError::platform(format!("session '{id}' not found")))
}

fn first_failure(
    sessions: &BTreeMap<SessionId, SessionState>,
    wanted: &BTreeSet<SessionId>,
) -> Option<FlowError> {
    wanted
        .iter()
        .filter_map(|id| sessions.get(id))
        .find_map(SessionState::failure)
}
