//! Checkpointed orchestration of suspendable flows.
//!
//! Flows are long-lived units of work that suspend while they wait on peer
//! sessions, external service calls, or wakeups, and resume from a durable
//! [`Checkpoint`] when the wait is satisfied. This crate provides:
//!
//! - **Checkpoint store**: atomic commit of a checkpoint with its outbound records
//! - **Session manager**: sequencing, out-of-order buffering, acknowledgement
//! - **External event correlator**: request/response matching with bounded retry
//! - **Error classifier**: fixed failure taxonomy shared by every component
//! - **Continuation dispatcher**: the per-event state machine
//! - **Cleanup scheduler**: idempotent reclamation records
//! - **Worker pool**: partition-exclusive processing keyed by flow id

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod checkpoint;
pub mod classify;
pub mod cleanup;
pub mod clock;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod external;
pub mod flow;
pub mod io;
pub mod message;
pub mod session;
pub mod types;
mod wait;
pub mod worker;

pub use checkpoint::{
    Checkpoint, CheckpointCodec, CheckpointStore, CheckpointWrite, Commit, FlowStatus,
    InMemoryCheckpointStore,
};
pub use classify::{Disposition, ErrorEnvelope, ErrorKind, FlowError};
pub use cleanup::CleanupScheduler;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use dispatcher::{Anomaly, ContinuationDispatcher, DispatchOutcome};
pub use error::{Error, Result};
pub use external::{CorrelationOutcome, ExternalEventCorrelator, ExternalEventState};
pub use flow::{FlowContext, FlowLogic, FlowOutcome, FlowRegistry, Resumed};
pub use io::{FlowIORequest, SessionInitiation};
pub use message::{
    CleanupTarget, ExternalResult, FlowStatusRecord, InboundBody, InboundEvent, OutboundRecord,
    SessionMessage, SessionMessageBody,
};
pub use session::{SessionManager, SessionState, SessionStatus};
pub use types::{Counterparty, FlowId, Payload, RequestId, SessionId};
pub use worker::{FlowWorkerPool, ProcessedEvent};
