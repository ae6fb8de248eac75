//! Built-in sample flows.
//!
//! `ping` opens a session to a peer, sends one message, waits for the reply
//! and closes. `echo` is the responder side: it receives one message, sends
//! it back and closes.

use std::sync::Arc;

use ferry_flow::{
    Counterparty, FlowContext, FlowError, FlowIORequest, FlowLogic, FlowOutcome, FlowRegistry,
    Payload, Resumed, SessionId, SessionInitiation,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Registry with every built-in flow.
#[must_use]
pub fn builtin_registry() -> FlowRegistry {
    let mut registry = FlowRegistry::new();
    registry.register("ping", Arc::new(Ping));
    registry.register("echo", Arc::new(Echo));
    registry
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Progress {
    step: u8,
    session: Option<SessionId>,
    payload: Option<Payload>,
}

impl Progress {
    fn load(ctx: &FlowContext<'_>) -> Result<Self, FlowError> {
        if ctx.state().is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(ctx.state().clone())
            .map_err(|e| FlowError::user_code(format!("corrupt flow state: {e}")))
    }

    fn save(&self, ctx: &mut FlowContext<'_>) -> Result<(), FlowError> {
        let state = serde_json::to_value(self)
            .map_err(|e| FlowError::user_code(format!("unserializable flow state: {e}")))?;
        ctx.set_state(state);
        Ok(())
    }

    fn session(&self) -> Result<SessionId, FlowError> {
        self.session
            .clone()
            .ok_or_else(|| FlowError::user_code("no session recorded"))
    }
}

/// Initiator: `StartFlow { args: { "peer": .., "message": .. } }`.
pub struct Ping;

impl FlowLogic for Ping {
    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        resumed: Resumed,
    ) -> Result<FlowOutcome, FlowError> {
        let mut progress = Progress::load(ctx)?;
        let outcome = match (progress.step, resumed) {
            (_, Resumed::Error { error }) => return Ok(FlowOutcome::Fail(error)),
            (0, Resumed::Start { args }) => {
                let peer = args["peer"]
                    .as_str()
                    .ok_or_else(|| FlowError::user_code("missing 'peer' argument"))?;
                let session_id = ctx.new_session_id();
                progress.session = Some(session_id.clone());
                progress.payload = Some(args.get("message").cloned().unwrap_or(json!("ping")));
                progress.step = 1;
                FlowOutcome::Suspend(FlowIORequest::InitiateSession {
                    sessions: vec![SessionInitiation {
                        session_id,
                        counterparty: Counterparty::from(peer),
                        protocol: "echo".to_string(),
                    }],
                })
            }
            (1, Resumed::Continue) => {
                progress.step = 2;
                FlowOutcome::Suspend(FlowIORequest::SendAndReceive {
                    payloads: [(progress.session()?, progress.payload.clone().unwrap_or_default())]
                        .into(),
                })
            }
            (2, Resumed::Received { mut payloads }) => {
                let session = progress.session()?;
                progress.payload = payloads.remove(&session);
                progress.step = 3;
                FlowOutcome::Suspend(FlowIORequest::close([session]))
            }
            (3, Resumed::Continue) => {
                return Ok(FlowOutcome::Finish(progress.payload.unwrap_or_default()));
            }
            (step, other) => {
                return Err(FlowError::user_code(format!(
                    "ping cannot resume step {step} with {other:?}"
                )));
            }
        };
        progress.save(ctx)?;
        Ok(outcome)
    }
}

/// Responder for `ping`.
pub struct Echo;

impl FlowLogic for Echo {
    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        resumed: Resumed,
    ) -> Result<FlowOutcome, FlowError> {
        let mut progress = Progress::load(ctx)?;
        let outcome = match (progress.step, resumed) {
            (_, Resumed::Error { error }) => return Ok(FlowOutcome::Fail(error)),
            (0, Resumed::Initiated { session_id, .. }) => {
                progress.session = Some(session_id.clone());
                progress.step = 1;
                FlowOutcome::Suspend(FlowIORequest::receive_from([session_id]))
            }
            (1, Resumed::Received { mut payloads }) => {
                let session = progress.session()?;
                let payload = payloads.remove(&session).unwrap_or_default();
                progress.payload = Some(payload.clone());
                progress.step = 2;
                FlowOutcome::Suspend(FlowIORequest::send_to(session, payload))
            }
            (2, Resumed::Continue) => {
                progress.step = 3;
                FlowOutcome::Suspend(FlowIORequest::close([progress.session()?]))
            }
            (3, Resumed::Continue) => {
                return Ok(FlowOutcome::Finish(progress.payload.unwrap_or_default()));
            }
            (step, other) => {
                return Err(FlowError::user_code(format!(
                    "echo cannot resume step {step} with {other:?}"
                )));
            }
        };
        progress.save(ctx)?;
        Ok(outcome)
    }
}
