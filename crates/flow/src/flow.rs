//! The contract between the pipeline and suspendable flow logic.
//!
//! Flow logic never holds a thread while it waits. Each call to
//! [`FlowLogic::resume`] runs the flow from one suspension point to the next
//! and returns what it is waiting for (or how it ended). Everything the flow
//! needs to continue later lives in [`FlowContext::state`], which is persisted
//! in the checkpoint.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::classify::FlowError;
use crate::io::FlowIORequest;
use crate::types::{Counterparty, FlowId, Payload, RequestId, SessionId};

/// Data handed to flow logic when it resumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resumed {
    /// First run of a flow started by `StartFlow`.
    Start { args: Payload },
    /// First run of a responder flow started by a peer's session init.
    Initiated {
        session_id: SessionId,
        counterparty: Counterparty,
    },
    /// Payloads received, one per session of the receive.
    Received {
        payloads: BTreeMap<SessionId, Payload>,
    },
    /// Response of an external call.
    ExternalEvent { payload: Payload },
    /// The wait ended in an error the flow may catch.
    Error { error: FlowError },
    /// The wait completed without data (send, initiate, close, wakeup).
    Continue,
}

/// How a run of flow logic ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowOutcome {
    /// Suspend until the request is satisfied.
    Suspend(FlowIORequest),
    /// The flow completed with a result.
    Finish(Payload),
    /// The flow gave up with an error it chose not to handle.
    Fail(FlowError),
}

/// Suspendable business logic.
///
/// Implementations must be deterministic given `(state, resumed)`: the same
/// inputs after a crash must yield the same outcome and the same ids.
/// Returning `Err` is the equivalent of throwing and fails the flow.
pub trait FlowLogic: Send + Sync {
    /// Run from the current suspension point to the next one.
    ///
    /// # Errors
    ///
    /// Any error returned terminates the flow as FAILED.
    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        resumed: Resumed,
    ) -> std::result::Result<FlowOutcome, FlowError>;
}

/// View of the checkpoint handed to flow logic.
pub struct FlowContext<'a> {
    flow_id: &'a FlowId,
    state: &'a mut Payload,
    next_session_ordinal: &'a mut u64,
    next_request_ordinal: &'a mut u64,
}

impl<'a> FlowContext<'a> {
    pub(crate) fn new(
        flow_id: &'a FlowId,
        state: &'a mut Payload,
        next_session_ordinal: &'a mut u64,
        next_request_ordinal: &'a mut u64,
    ) -> Self {
        Self {
            flow_id,
            state,
            next_session_ordinal,
            next_request_ordinal,
        }
    }

    /// Id of the running flow.
    #[must_use]
    pub fn flow_id(&self) -> &FlowId {
        self.flow_id
    }

    /// Persisted flow state.
    #[must_use]
    pub fn state(&self) -> &Payload {
        self.state
    }

    /// Replace the persisted flow state.
    pub fn set_state(&mut self, state: Payload) {
        *self.state = state;
    }

    /// Allocate the next session id for this flow.
    pub fn new_session_id(&mut self) -> SessionId {
        let id = SessionId::derive(self.flow_id, *self.next_session_ordinal);
        *self.next_session_ordinal = self.next_session_ordinal.saturating_add(1);
        id
    }

    /// Allocate the next external request id for this flow.
    pub fn new_request_id(&mut self) -> RequestId {
        let id = RequestId::derive(self.flow_id, *self.next_request_ordinal);
        *self.next_request_ordinal = self.next_request_ordinal.saturating_add(1);
        id
    }
}

/// Registry of flow logic by name.
///
/// Names are used by `StartFlow` and as the protocol of inbound session
/// inits. A name can be administratively disabled at runtime, after which
/// every flow running under it is killed on its next event.
#[derive(Default)]
pub struct FlowRegistry {
    flows: HashMap<String, Arc<dyn FlowLogic>>,
    disabled: RwLock<HashSet<String>>,
}

impl FlowRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register flow logic under a name.
    pub fn register(&mut self, name: impl Into<String>, logic: Arc<dyn FlowLogic>) {
        self.flows.insert(name.into(), logic);
    }

    /// Get flow logic by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn FlowLogic>> {
        self.flows.get(name).cloned()
    }

    /// Check if a flow is registered under the name.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.flows.contains_key(name)
    }

    /// Administratively disable a flow name.
    pub fn disable(&self, name: impl Into<String>) {
        let name = name.into();
        match self.disabled.write() {
            Ok(mut disabled) => {
                disabled.insert(name);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(name);
            }
        }
    }

    /// Re-enable a flow name.
    pub fn enable(&self, name: &str) {
        match self.disabled.write() {
            Ok(mut disabled) => {
                disabled.remove(name);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(name);
            }
        }
    }

    /// Check if a flow name is disabled.
    #[must_use]
    pub fn is_disabled(&self, name: &str) -> bool {
        match self.disabled.read() {
            Ok(disabled) => disabled.contains(name),
            Err(poisoned) => poisoned.into_inner().contains(name),
        }
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.flows.keys().map(String::as_str).sorted().collect()
    }
}
