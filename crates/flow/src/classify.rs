//! Error classification.
//!
//! Every failure that crosses the pipeline is mapped into a fixed taxonomy.
//! The kind decides what happens next: retry, resume the flow with an error
//! it can observe, dead-letter the flow, or fail it outright.
//!
//! Classification is supplied by the originating collaborator through an
//! [`ErrorEnvelope`]; it is never inferred from message text. An envelope
//! without a kind is classified as [`ErrorKind::Platform`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retry; invisible to flow logic until the retry budget is spent.
    Transient,
    /// Resume the flow with an error it can observe and catch.
    Platform,
    /// Never resume; route to dead-letter handling.
    Fatal,
    /// Raised by flow logic itself.
    UserCode,
    /// An operation the pipeline or a collaborator does not implement.
    Unsupported,
}

impl ErrorKind {
    /// Kinds that are handed back into flow logic as an error value.
    #[must_use]
    pub const fn is_observable_by_flow(self) -> bool {
        matches!(self, Self::Platform | Self::UserCode | Self::Unsupported)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Platform => "platform",
            Self::Fatal => "fatal",
            Self::UserCode => "user_code",
            Self::Unsupported => "unsupported",
        };
        write!(f, "{s}")
    }
}

/// Failure as reported by a collaborator (crypto service, persistence
/// service, counterparty).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Classification chosen by the collaborator, if any.
    #[serde(default)]
    pub kind: Option<ErrorKind>,
    /// Human readable description.
    pub message: String,
}

impl ErrorEnvelope {
    /// Create a classified envelope.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            message: message.into(),
        }
    }

    /// Create an envelope without a classification.
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
        }
    }
}

/// Typed error object passed into flow logic and published with FAILED
/// statuses.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct FlowError {
    /// Classification.
    pub kind: ErrorKind,
    /// Human readable description.
    pub message: String,
}

impl FlowError {
    /// Create a new flow error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create a platform error.
    pub fn platform(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Platform, message)
    }

    /// Create a user code error.
    pub fn user_code(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UserCode, message)
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    /// Convert back into an envelope for the wire.
    #[must_use]
    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope::new(self.kind, self.message.clone())
    }
}

/// What the pipeline does with a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the flow suspended and retry the call later.
    Retry,
    /// Resume the flow with the error.
    ResumeWithError,
    /// Never resume; record for out-of-band inspection.
    DeadLetter,
    /// Terminate the flow as FAILED.
    FailFlow,
}

/// Classify a collaborator failure.
#[must_use]
pub fn classify(envelope: &ErrorEnvelope) -> FlowError {
    FlowError::new(
        envelope.kind.unwrap_or(ErrorKind::Platform),
        envelope.message.clone(),
    )
}

/// Classify a failure reported by a counterparty on a session.
///
/// Sessions are never retried, and a peer cannot dead-letter our flow, so
/// anything other than an observable kind propagates as `Platform`.
#[must_use]
pub fn classify_session_error(envelope: &ErrorEnvelope) -> FlowError {
    let error = classify(envelope);
    if error.kind.is_observable_by_flow() {
        error
    } else {
        FlowError::platform(error.message)
    }
}

/// Classify an error returned by flow logic.
///
/// Whatever flow logic throws terminates the flow; platform errors it
/// rethrows keep their kind, anything else is attributed to user code.
#[must_use]
pub fn classify_flow_logic_error(error: FlowError) -> FlowError {
    match error.kind {
        ErrorKind::Platform | ErrorKind::UserCode | ErrorKind::Unsupported => error,
        ErrorKind::Transient | ErrorKind::Fatal => FlowError::user_code(error.message),
    }
}

/// Disposition of a failure reported by a collaborator.
#[must_use]
pub const fn disposition(kind: ErrorKind) -> Disposition {
    match kind {
        ErrorKind::Transient => Disposition::Retry,
        ErrorKind::Platform | ErrorKind::Unsupported => Disposition::ResumeWithError,
        ErrorKind::Fatal => Disposition::DeadLetter,
        ErrorKind::UserCode => Disposition::FailFlow,
    }
}

/// Escalate a Transient failure whose retry budget is exhausted.
#[must_use]
pub fn escalate_exhausted(error: &FlowError, attempts: u32) -> FlowError {
    FlowError::platform(format!(
        "retry budget exhausted after {attempts} attempts: {}",
        error.message
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unclassified_defaults_to_platform() {
        let error = classify(&ErrorEnvelope::unclassified("boom"));
        assert_eq!(error.kind, ErrorKind::Platform);
        assert_eq!(error.message, "boom");
    }

    #[test]
    fn test_classification_comes_from_envelope_not_text() {
        let error = classify(&ErrorEnvelope::new(ErrorKind::Platform, "transient failure"));
        assert_eq!(error.kind, ErrorKind::Platform);
        let error = classify(&ErrorEnvelope::new(ErrorKind::Transient, "fatal"));
        assert_eq!(error.kind, ErrorKind::Transient);
    }

    #[test]
    fn test_dispositions() {
        assert_eq!(disposition(ErrorKind::Transient), Disposition::Retry);
        assert_eq!(disposition(ErrorKind::Platform), Disposition::ResumeWithError);
        assert_eq!(disposition(ErrorKind::Unsupported), Disposition::ResumeWithError);
        assert_eq!(disposition(ErrorKind::Fatal), Disposition::DeadLetter);
        assert_eq!(disposition(ErrorKind::UserCode), Disposition::FailFlow);
    }

    #[test]
    fn test_session_errors_never_retry_or_dead_letter() {
        let transient = classify_session_error(&ErrorEnvelope::new(ErrorKind::Transient, "x"));
        assert_eq!(transient.kind, ErrorKind::Platform);
        let fatal = classify_session_error(&ErrorEnvelope::new(ErrorKind::Fatal, "x"));
        assert_eq!(fatal.kind, ErrorKind::Platform);
        let unsupported =
            classify_session_error(&ErrorEnvelope::new(ErrorKind::Unsupported, "x"));
        assert_eq!(unsupported.kind, ErrorKind::Unsupported);
    }

    #[test]
    fn test_flow_logic_errors() {
        let rethrown = classify_flow_logic_error(FlowError::platform("peer went away"));
        assert_eq!(rethrown.kind, ErrorKind::Platform);
        let odd = classify_flow_logic_error(FlowError::new(ErrorKind::Transient, "x"));
        assert_eq!(odd.kind, ErrorKind::UserCode);
    }

    #[test]
    fn test_escalation_is_platform() {
        let transient = FlowError::new(ErrorKind::Transient, "timeout");
        let escalated = escalate_exhausted(&transient, 3);
        assert_eq!(escalated.kind, ErrorKind::Platform);
        assert!(escalated.message.contains("3 attempts"));
        assert!(escalated.message.contains("timeout"));
    }

    #[test]
    fn test_flow_error_display() {
        let error = FlowError::user_code("division by zero");
        assert_eq!(error.to_string(), "user_code error: division by zero");
    }
}
