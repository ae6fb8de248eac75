//! External-call correlation with resend and staleness detection.
//!
//! A pending call is keyed by its request id. Transient failures are absorbed
//! here: the same request id is resent once the resend window has elapsed,
//! with an incremented attempt number, until the retry budget runs out and
//! the failure is escalated to a Platform error.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::classify::{self, Disposition, ErrorKind, FlowError};
use crate::message::{ExternalResult, OutboundRecord};
use crate::types::{FlowId, Payload, RequestId};

/// How a pending call ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExternalResolution {
    Completed { payload: Payload },
    Failed { error: FlowError },
}

/// A call awaiting its response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEventState {
    pub request_id: RequestId,
    pub factory: String,
    pub input: Payload,
    pub sent_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    /// Resends so far; the current attempt number.
    pub retry_count: u32,
    /// Transient failure of the current attempt, cleared by a resend.
    pub last_error: Option<FlowError>,
    /// Set once the call is settled; consumed when the flow resumes.
    pub resolution: Option<ExternalResolution>,
}

impl ExternalEventState {
    fn request_record(&self, flow_id: &FlowId) -> OutboundRecord {
        OutboundRecord::ExternalEventRequest {
            flow_id: flow_id.clone(),
            request_id: self.request_id.clone(),
            factory: self.factory.clone(),
            input: self.input.clone(),
            ttl_seconds: self.ttl_seconds,
            attempt: self.retry_count,
        }
    }
}

/// Result of applying a response.
#[derive(Debug, Clone, PartialEq)]
pub enum CorrelationOutcome {
    /// The call is settled; the flow may resume.
    Resolved,
    /// Transient failure; `resend` is set if the window had already elapsed.
    Retrying { resend: Option<OutboundRecord> },
    /// Fatal failure; the flow must never resume.
    DeadLetter(FlowError),
    /// Response to a call that was already settled, or a failure of an
    /// attempt whose failure is already recorded.
    Duplicate,
    /// Response to an unknown call or to an attempt other than the current
    /// one. An untagged response counts as attempt 0.
    Stale,
}

/// Matches responses to pending calls.
#[derive(Debug, Clone)]
pub struct ExternalEventCorrelator {
    resend_window: Duration,
    max_retries: u32,
    default_ttl_seconds: u64,
}

impl ExternalEventCorrelator {
    /// Create a correlator.
    #[must_use]
    pub const fn new(resend_window: Duration, max_retries: u32, default_ttl_seconds: u64) -> Self {
        Self {
            resend_window,
            max_retries,
            default_ttl_seconds,
        }
    }

    /// Record a new pending call and build its request record.
    ///
    /// # Errors
    ///
    /// Returns a platform error if the request id is already in use.
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &self,
        pending: &mut BTreeMap<RequestId, ExternalEventState>,
        flow_id: &FlowId,
        request_id: RequestId,
        factory: String,
        input: Payload,
        ttl_seconds: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<OutboundRecord, FlowError> {
        if pending.contains_key(&request_id) {
            return Err(FlowError::platform(format!(
                "external request '{request_id}' is already pending"
            )));
        }
        let state = ExternalEventState {
            request_id: request_id.clone(),
            factory,
            input,
            sent_at: now,
            ttl_seconds: ttl_seconds.unwrap_or(self.default_ttl_seconds),
            retry_count: 0,
            last_error: None,
            resolution: None,
        };
        let record = state.request_record(flow_id);
        debug!(flow_id = %flow_id, request_id = %request_id, factory = %state.factory, "External request sent");
        pending.insert(request_id, state);
        Ok(record)
    }

    /// Apply a response.
    #[allow(clippy::too_many_arguments)]
    pub fn on_response(
        &self,
        flow_id: &FlowId,
        pending: &mut BTreeMap<RequestId, ExternalEventState>,
        completed: &BTreeSet<RequestId>,
        request_id: &RequestId,
        attempt: Option<u32>,
        result: ExternalResult,
        now: DateTime<Utc>,
    ) -> CorrelationOutcome {
        let Some(state) = pending.get_mut(request_id) else {
            if completed.contains(request_id) {
                debug!(flow_id = %flow_id, request_id = %request_id, "Response for a settled request");
                return CorrelationOutcome::Duplicate;
            }
            warn!(flow_id = %flow_id, request_id = %request_id, "Response for an unknown request");
            return CorrelationOutcome::Stale;
        };
        if state.resolution.is_some() {
            debug!(flow_id = %flow_id, request_id = %request_id, "Response for a settled request");
            return CorrelationOutcome::Duplicate;
        }
        // an untagged response is taken as an answer to the first attempt
        let attempt = attempt.unwrap_or(0);
        if attempt != state.retry_count {
            warn!(
                flow_id = %flow_id,
                request_id = %request_id,
                attempt,
                current = state.retry_count,
                "Response for a superseded or unsent attempt"
            );
            return CorrelationOutcome::Stale;
        }
        if state.last_error.is_some() && matches!(result, ExternalResult::Err(_)) {
            debug!(
                flow_id = %flow_id,
                request_id = %request_id,
                attempt,
                "Failure already recorded for this attempt"
            );
            return CorrelationOutcome::Duplicate;
        }

        let error = match result {
            ExternalResult::Ok(payload) => {
                state.resolution = Some(ExternalResolution::Completed { payload });
                debug!(flow_id = %flow_id, request_id = %request_id, "External request completed");
                return CorrelationOutcome::Resolved;
            }
            ExternalResult::Err(envelope) => classify::classify(&envelope),
        };

        match classify::disposition(error.kind) {
            Disposition::Retry => self.on_transient(flow_id, state, error, now),
            Disposition::DeadLetter => {
                error!(flow_id = %flow_id, request_id = %request_id, error = %error, "External request failed fatally");
                CorrelationOutcome::DeadLetter(error)
            }
            Disposition::ResumeWithError | Disposition::FailFlow => {
                // collaborator user-code failures propagate like platform ones
                let error = if error.kind == ErrorKind::UserCode {
                    FlowError::platform(error.message)
                } else {
                    error
                };
                debug!(flow_id = %flow_id, request_id = %request_id, error = %error, "External request failed");
                state.resolution = Some(ExternalResolution::Failed { error });
                CorrelationOutcome::Resolved
            }
        }
    }

    fn on_transient(
        &self,
        flow_id: &FlowId,
        state: &mut ExternalEventState,
        error: FlowError,
        now: DateTime<Utc>,
    ) -> CorrelationOutcome {
        if state.retry_count >= self.max_retries {
            let attempts = state.retry_count.saturating_add(1);
            let escalated = classify::escalate_exhausted(&error, attempts);
            warn!(
                flow_id = %flow_id,
                request_id = %state.request_id,
                attempts,
                "External request retry budget exhausted"
            );
            state.last_error = Some(error);
            state.resolution = Some(ExternalResolution::Failed { error: escalated });
            return CorrelationOutcome::Resolved;
        }

        state.last_error = Some(error);
        let resend = self
            .should_retry(state, now)
            .then(|| self.retry(flow_id, state, now));
        CorrelationOutcome::Retrying { resend }
    }

    /// True iff the last failure was Transient and the resend window has
    /// elapsed since the current attempt was sent.
    #[must_use]
    pub fn should_retry(&self, state: &ExternalEventState, now: DateTime<Utc>) -> bool {
        state.resolution.is_none()
            && state
                .last_error
                .as_ref()
                .is_some_and(|e| e.kind == ErrorKind::Transient)
            && now - state.sent_at >= self.resend_window
    }

    /// Resend the same request as the next attempt.
    pub fn retry(
        &self,
        flow_id: &FlowId,
        state: &mut ExternalEventState,
        now: DateTime<Utc>,
    ) -> OutboundRecord {
        state.retry_count = state.retry_count.saturating_add(1);
        state.sent_at = now;
        state.last_error = None;
        debug!(
            flow_id = %flow_id,
            request_id = %state.request_id,
            attempt = state.retry_count,
            "External request resent"
        );
        state.request_record(flow_id)
    }

    /// Resend every pending call whose retry is due.
    pub fn retry_due(
        &self,
        flow_id: &FlowId,
        pending: &mut BTreeMap<RequestId, ExternalEventState>,
        now: DateTime<Utc>,
    ) -> Vec<OutboundRecord> {
        pending
            .values_mut()
            .filter(|state| self.should_retry(state, now))
            .map(|state| self.retry(flow_id, state, now))
            .collect()
    }
}
