//! Shared fixtures for pipeline tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Duration;
use ferry_flow::{
    CheckpointStore, CleanupTarget, ContinuationDispatcher, Counterparty, DispatchOutcome,
    EngineConfig, ErrorEnvelope, ErrorKind, ExternalResult, FlowContext, FlowError,
    FlowIORequest, FlowLogic, FlowOutcome, FlowRegistry, FlowStatus, FlowStatusRecord,
    InMemoryCheckpointStore, InboundBody, InboundEvent, ManualClock, OutboundRecord, Payload,
    RequestId, Resumed, SessionId, SessionInitiation, SessionMessageBody,
};
use serde_json::json;

pub struct Harness {
    pub dispatcher: ContinuationDispatcher,
    pub store: Arc<InMemoryCheckpointStore>,
    pub clock: Arc<ManualClock>,
    pub registry: Arc<FlowRegistry>,
}

impl Harness {
    pub fn new(registry: FlowRegistry) -> Self {
        Self::with_config(registry, &test_config())
    }

    pub fn with_config(registry: FlowRegistry, config: &EngineConfig) -> Self {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let clock = Arc::new(ManualClock::default());
        let registry = Arc::new(registry);
        let dispatcher = ContinuationDispatcher::new(
            store.clone(),
            Arc::clone(&registry),
            clock.clone(),
            config,
        );
        Self {
            dispatcher,
            store,
            clock,
            registry,
        }
    }

    pub async fn send(&self, flow_id: &str, body: InboundBody) -> DispatchOutcome {
        self.dispatcher
            .process(InboundEvent::new(flow_id, body))
            .await
            .expect("event should process")
    }

    pub async fn checkpoint(&self, flow_id: &str) -> Option<ferry_flow::Checkpoint> {
        self.store.get(&flow_id.into()).await.unwrap()
    }

    pub fn advance(&self, seconds: i64) {
        self.clock.advance(Duration::seconds(seconds));
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        external_resend_window_ms: 5_000,
        max_external_retries: 2,
        session_resend_window_ms: 30_000,
        ..EngineConfig::default()
    }
}

pub fn logic(flow: impl FlowLogic + 'static) -> Arc<dyn FlowLogic> {
    Arc::new(flow)
}

pub fn registry(flows: Vec<(&str, Arc<dyn FlowLogic>)>) -> FlowRegistry {
    let mut registry = FlowRegistry::new();
    for (name, logic) in flows {
        registry.register(name, logic);
    }
    registry
}

// ----------------------------------------------------------------------------
// Inbound event builders
// ----------------------------------------------------------------------------

pub fn start(flow_name: &str) -> InboundBody {
    InboundBody::StartFlow {
        flow_name: flow_name.to_string(),
        args: json!(null),
    }
}

pub fn session_init(session: &SessionId, protocol: &str) -> InboundBody {
    InboundBody::SessionInit {
        session_id: session.clone(),
        counterparty: Counterparty::from("bob"),
        protocol: protocol.to_string(),
    }
}

pub fn data(session: &SessionId, seq: u64, payload: Payload) -> InboundBody {
    InboundBody::SessionData {
        session_id: session.clone(),
        seq,
        payload,
    }
}

pub fn close(session: &SessionId, seq: u64) -> InboundBody {
    InboundBody::SessionClose {
        session_id: session.clone(),
        seq,
    }
}

pub fn ack(session: &SessionId, received_seq: u64) -> InboundBody {
    InboundBody::SessionAck {
        session_id: session.clone(),
        received_seq,
    }
}

pub fn response(request_id: &RequestId, attempt: u32, result: ExternalResult) -> InboundBody {
    InboundBody::ExternalEventResponse {
        request_id: request_id.clone(),
        attempt: Some(attempt),
        result,
    }
}

pub fn transient(message: &str) -> ExternalResult {
    ExternalResult::Err(ErrorEnvelope::new(ErrorKind::Transient, message))
}

pub fn session_error(session: &SessionId, kind: ErrorKind, message: &str) -> InboundBody {
    InboundBody::SessionError {
        session_id: session.clone(),
        error: ErrorEnvelope::new(kind, message),
    }
}

pub fn kill(reason: &str) -> InboundBody {
    InboundBody::KillFlow {
        reason: reason.to_string(),
    }
}

pub fn wakeup(token: u64) -> InboundBody {
    InboundBody::Wakeup { token: Some(token) }
}

pub fn tick() -> InboundBody {
    InboundBody::Wakeup { token: None }
}

// ----------------------------------------------------------------------------
// Record inspection
// ----------------------------------------------------------------------------

pub fn statuses(records: &[OutboundRecord]) -> Vec<FlowStatusRecord> {
    records
        .iter()
        .filter_map(|r| match r {
            OutboundRecord::FlowStatus(status) => Some(status.clone()),
            _ => None,
        })
        .collect()
}

pub fn status_kinds(records: &[OutboundRecord]) -> Vec<FlowStatus> {
    statuses(records).into_iter().map(|s| s.status).collect()
}

pub fn cleanups(records: &[OutboundRecord]) -> Vec<CleanupTarget> {
    records
        .iter()
        .filter_map(|r| match r {
            OutboundRecord::CleanupScheduled { target } => Some(target.clone()),
            _ => None,
        })
        .collect()
}

pub fn session_messages(records: &[OutboundRecord]) -> Vec<(SessionId, SessionMessageBody)> {
    records
        .iter()
        .filter_map(|r| match r {
            OutboundRecord::Session(m) => Some((m.session_id.clone(), m.message.clone())),
            _ => None,
        })
        .collect()
}

pub fn acks(records: &[OutboundRecord]) -> Vec<u64> {
    session_messages(records)
        .into_iter()
        .filter_map(|(_, m)| match m {
            SessionMessageBody::Ack { received_seq } => Some(received_seq),
            _ => None,
        })
        .collect()
}

pub fn session_errors(records: &[OutboundRecord]) -> Vec<SessionId> {
    session_messages(records)
        .into_iter()
        .filter_map(|(id, m)| matches!(m, SessionMessageBody::Error { .. }).then_some(id))
        .collect()
}

pub fn wakeup_tokens(records: &[OutboundRecord]) -> Vec<u64> {
    records
        .iter()
        .filter_map(|r| match r {
            OutboundRecord::Wakeup { token, .. } => *token,
            _ => None,
        })
        .collect()
}

pub fn external_requests(records: &[OutboundRecord]) -> Vec<(RequestId, u32)> {
    records
        .iter()
        .filter_map(|r| match r {
            OutboundRecord::ExternalEventRequest {
                request_id, attempt, ..
            } => Some((request_id.clone(), *attempt)),
            _ => None,
        })
        .collect()
}

// ----------------------------------------------------------------------------
// Scripted flows
// ----------------------------------------------------------------------------

fn step(ctx: &FlowContext<'_>) -> u64 {
    ctx.state()["step"].as_u64().unwrap_or(0)
}

fn session_of(ctx: &FlowContext<'_>, key: &str) -> SessionId {
    SessionId::from(ctx.state()[key].as_str().unwrap_or_default())
}

/// Opens one session per counterparty in `peers`, then yields once, then
/// finishes. Errors are rethrown.
pub struct Initiator {
    pub peers: Vec<&'static str>,
}

impl FlowLogic for Initiator {
    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        resumed: Resumed,
    ) -> Result<FlowOutcome, FlowError> {
        if let Resumed::Error { error } = resumed {
            return Ok(FlowOutcome::Fail(error));
        }
        match step(ctx) {
            0 => {
                let sessions: Vec<SessionInitiation> = self
                    .peers
                    .iter()
                    .map(|peer| SessionInitiation {
                        session_id: ctx.new_session_id(),
                        counterparty: Counterparty::from(*peer),
                        protocol: "echo".to_string(),
                    })
                    .collect();
                let ids: Vec<_> = sessions.iter().map(|s| s.session_id.as_str().to_string()).collect();
                ctx.set_state(json!({"step": 1, "sessions": ids}));
                Ok(FlowOutcome::Suspend(FlowIORequest::InitiateSession { sessions }))
            }
            1 => {
                let mut state = ctx.state().clone();
                state["step"] = json!(2);
                ctx.set_state(state);
                Ok(FlowOutcome::Suspend(FlowIORequest::Wakeup))
            }
            _ => Ok(FlowOutcome::Finish(json!("done"))),
        }
    }
}

/// Responder that receives once and finishes with what it got.
pub struct Receiver;

impl FlowLogic for Receiver {
    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        resumed: Resumed,
    ) -> Result<FlowOutcome, FlowError> {
        match resumed {
            Resumed::Initiated { session_id, .. } => {
                ctx.set_state(json!({"session": session_id.as_str()}));
                Ok(FlowOutcome::Suspend(FlowIORequest::receive_from([session_id])))
            }
            Resumed::Received { payloads } => {
                let session = session_of(ctx, "session");
                Ok(FlowOutcome::Finish(
                    payloads.get(&session).cloned().unwrap_or(Payload::Null),
                ))
            }
            Resumed::Error { error } => Ok(FlowOutcome::Fail(error)),
            other => Err(FlowError::user_code(format!("unexpected resume {other:?}"))),
        }
    }
}

/// Responder that closes its session, then reports the sub-flow finished.
pub struct Closer;

impl FlowLogic for Closer {
    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        resumed: Resumed,
    ) -> Result<FlowOutcome, FlowError> {
        match (step(ctx), resumed) {
            (0, Resumed::Initiated { session_id, .. }) => {
                ctx.set_state(json!({"step": 1, "session": session_id.as_str()}));
                Ok(FlowOutcome::Suspend(FlowIORequest::close([session_id])))
            }
            (1, Resumed::Continue) => {
                let session = session_of(ctx, "session");
                ctx.set_state(json!({"step": 2, "session": session.as_str()}));
                Ok(FlowOutcome::Suspend(FlowIORequest::SubFlowFinished {
                    sessions: BTreeSet::from([session]),
                }))
            }
            (2, Resumed::Continue) => Ok(FlowOutcome::Finish(json!("closed"))),
            (_, Resumed::Error { error }) => Ok(FlowOutcome::Fail(error)),
            (_, other) => Err(FlowError::user_code(format!("unexpected resume {other:?}"))),
        }
    }
}

/// Calls an external service once. A success finishes with the payload; an
/// error is caught and reported in the result.
pub struct ExternalCaller;

impl FlowLogic for ExternalCaller {
    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        resumed: Resumed,
    ) -> Result<FlowOutcome, FlowError> {
        match resumed {
            Resumed::Start { .. } | Resumed::Initiated { .. } if step(ctx) != 0 => {
                Err(FlowError::user_code("started twice"))
            }
            Resumed::Start { args } => Ok(call_external(ctx, args)),
            Resumed::Initiated { .. } => Ok(call_external(ctx, Payload::Null)),
            Resumed::ExternalEvent { payload } => Ok(FlowOutcome::Finish(payload)),
            Resumed::Error { error } => Ok(FlowOutcome::Finish(json!({
                "caught": error.kind,
                "message": error.message,
            }))),
            other => Err(FlowError::user_code(format!("unexpected resume {other:?}"))),
        }
    }
}

fn call_external(ctx: &mut FlowContext<'_>, input: Payload) -> FlowOutcome {
    let request_id = ctx.new_request_id();
    ctx.set_state(json!({"step": 1}));
    FlowOutcome::Suspend(FlowIORequest::ExternalEvent {
        request_id,
        factory: "sign".to_string(),
        input,
        ttl_seconds: None,
    })
}

/// Opens a session to each of `peers`, receives once from all of them and
/// finishes with the payloads keyed by counterparty. Errors are rethrown.
pub struct Gatherer {
    pub peers: Vec<&'static str>,
}

impl FlowLogic for Gatherer {
    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        resumed: Resumed,
    ) -> Result<FlowOutcome, FlowError> {
        if let Resumed::Error { error } = resumed {
            return Ok(FlowOutcome::Fail(error));
        }
        match (step(ctx), resumed) {
            (0, _) => {
                let sessions: Vec<SessionInitiation> = self
                    .peers
                    .iter()
                    .map(|peer| SessionInitiation {
                        session_id: ctx.new_session_id(),
                        counterparty: Counterparty::from(*peer),
                        protocol: "echo".to_string(),
                    })
                    .collect();
                let peers: serde_json::Map<String, Payload> = sessions
                    .iter()
                    .map(|s| (s.session_id.as_str().to_string(), json!(s.counterparty.as_str())))
                    .collect();
                ctx.set_state(json!({"step": 1, "peers": peers}));
                Ok(FlowOutcome::Suspend(FlowIORequest::InitiateSession { sessions }))
            }
            (1, _) => {
                let mut state = ctx.state().clone();
                let ids: Vec<SessionId> = state["peers"]
                    .as_object()
                    .map(|peers| peers.keys().map(|k| SessionId::from(k.as_str())).collect())
                    .unwrap_or_default();
                state["step"] = json!(2);
                ctx.set_state(state);
                Ok(FlowOutcome::Suspend(FlowIORequest::receive_from(ids)))
            }
            (_, Resumed::Received { payloads }) => {
                let peers = ctx.state()["peers"].clone();
                let by_peer: serde_json::Map<String, Payload> = payloads
                    .into_iter()
                    .map(|(id, payload)| {
                        let peer = peers[id.as_str()].as_str().unwrap_or_default().to_string();
                        (peer, payload)
                    })
                    .collect();
                Ok(FlowOutcome::Finish(Payload::Object(by_peer)))
            }
            (_, other) => Err(FlowError::user_code(format!("unexpected resume {other:?}"))),
        }
    }
}

/// Opens two sessions, closes the first, then throws.
pub struct Thrower;

impl FlowLogic for Thrower {
    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        resumed: Resumed,
    ) -> Result<FlowOutcome, FlowError> {
        match step(ctx) {
            0 => {
                let first = ctx.new_session_id();
                let second = ctx.new_session_id();
                ctx.set_state(json!({"step": 1, "first": first.as_str()}));
                Ok(FlowOutcome::Suspend(FlowIORequest::InitiateSession {
                    sessions: vec![
                        SessionInitiation {
                            session_id: first,
                            counterparty: Counterparty::from("alice"),
                            protocol: "echo".to_string(),
                        },
                        SessionInitiation {
                            session_id: second,
                            counterparty: Counterparty::from("carol"),
                            protocol: "echo".to_string(),
                        },
                    ],
                }))
            }
            1 => {
                let first = session_of(ctx, "first");
                ctx.set_state(json!({"step": 2, "first": first.as_str()}));
                Ok(FlowOutcome::Suspend(FlowIORequest::close([first])))
            }
            _ => {
                let _ = resumed;
                Err(FlowError::user_code("boom"))
            }
        }
    }
}

/// Payload map helper.
pub fn payloads(entries: &[(&SessionId, Payload)]) -> BTreeMap<SessionId, Payload> {
    entries
        .iter()
        .map(|(id, payload)| ((*id).clone(), payload.clone()))
        .collect()
}
