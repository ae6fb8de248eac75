//! Cleanup scheduling.
//!
//! Emits records telling downstream consumers to reclaim the resources held
//! for a session or a flow. The records are idempotent at the consumer and
//! are not deduplicated here, so calling this twice for the same ids is safe.

use tracing::debug;

use crate::message::{CleanupTarget, OutboundRecord};
use crate::types::{FlowId, SessionId};

/// Builds cleanup records.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupScheduler;

impl CleanupScheduler {
    /// Create a scheduler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// One record per session, then one for the flow key itself.
    #[must_use]
    pub fn schedule_cleanup<'a>(
        &self,
        flow_id: &FlowId,
        session_ids: impl IntoIterator<Item = &'a SessionId>,
    ) -> Vec<OutboundRecord> {
        let mut records: Vec<OutboundRecord> = session_ids
            .into_iter()
            .map(|id| OutboundRecord::CleanupScheduled {
                target: CleanupTarget::Session(id.clone()),
            })
            .collect();
        debug!(flow_id = %flow_id, sessions = records.len(), "Cleanup scheduled");
        records.push(OutboundRecord::CleanupScheduled {
            target: CleanupTarget::Flow(flow_id.clone()),
        });
        records
    }
}
