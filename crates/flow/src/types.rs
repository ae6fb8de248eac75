//! Identifiers and payload types shared across the pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

/// Payload carried by session messages, external calls and flow results.
pub type Payload = serde_json::Value;

/// Unique identifier for a flow.
///
/// The flow id is the partition key of the transport: every ordering
/// guarantee in the pipeline is scoped to one flow id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(String);

impl FlowId {
    /// Create a new random flow ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Create a flow ID from an existing string.
    #[must_use]
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the flow ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace for ids derived from this flow.
    fn namespace(&self) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_DNS, self.0.as_bytes())
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FlowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a session between a flow and one counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Create a session ID from an existing string.
    #[must_use]
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the `ordinal`-th session id of a flow.
    ///
    /// Replayed flow logic allocates the same ids in the same order, so the
    /// derivation must stay a pure function of its inputs.
    #[must_use]
    pub fn derive(flow_id: &FlowId, ordinal: u64) -> Self {
        let name = format!("session:{ordinal}");
        Self(Uuid::new_v5(&flow_id.namespace(), name.as_bytes()).to_string())
    }

    /// Get the session ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier correlating an external-call request with its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Create a request ID from an existing string.
    #[must_use]
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the `ordinal`-th external request id of a flow.
    #[must_use]
    pub fn derive(flow_id: &FlowId, ordinal: u64) -> Self {
        let name = format!("external:{ordinal}");
        Self(Uuid::new_v5(&flow_id.namespace(), name.as_bytes()).to_string())
    }

    /// Get the request ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of the peer at the other end of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Counterparty(String);

impl Counterparty {
    /// Create a counterparty from its name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the counterparty name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Counterparty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Counterparty {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_ids_are_unique() {
        assert_ne!(FlowId::new(), FlowId::new());
    }

    #[test]
    fn test_session_id_derivation_is_deterministic() {
        let flow = FlowId::from("flow-1");
        assert_eq!(SessionId::derive(&flow, 0), SessionId::derive(&flow, 0));
        assert_ne!(SessionId::derive(&flow, 0), SessionId::derive(&flow, 1));
    }

    #[test]
    fn test_derived_ids_are_flow_scoped() {
        let a = FlowId::from("flow-a");
        let b = FlowId::from("flow-b");
        assert_ne!(SessionId::derive(&a, 0), SessionId::derive(&b, 0));
        assert_ne!(RequestId::derive(&a, 0), RequestId::derive(&b, 0));
    }

    #[test]
    fn test_session_and_request_ids_do_not_collide() {
        let flow = FlowId::from("flow-1");
        assert_ne!(
            SessionId::derive(&flow, 3).as_str(),
            RequestId::derive(&flow, 3).as_str()
        );
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = SessionId::from("s-1");
        let json = serde_json::to_string(&id).ok();
        assert_eq!(json.as_deref(), Some("\"s-1\""));
    }
}
