//! Checkpoint persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Checkpoint, CheckpointCodec, FlowStatus};
use crate::error::Result;
use crate::message::OutboundRecord;
use crate::types::FlowId;

/// What a commit does to the stored checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointWrite {
    Put(Box<Checkpoint>),
    Delete,
    Keep,
}

/// Everything produced by processing one inbound event.
///
/// Applied atomically: after a commit either all of it is visible or none.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub flow_id: FlowId,
    pub write: CheckpointWrite,
    pub records: Vec<OutboundRecord>,
    /// Terminal status to remember for the flow id.
    pub terminal_status: Option<FlowStatus>,
}

/// Durable store for checkpoints and the records committed with them.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint of a flow.
    async fn get(&self, flow_id: &FlowId) -> Result<Option<Checkpoint>>;

    /// Store a checkpoint.
    async fn put(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Delete the checkpoint of a flow.
    async fn delete(&self, flow_id: &FlowId) -> Result<()>;

    /// Atomically apply a checkpoint write and publish its records.
    async fn commit(&self, commit: Commit) -> Result<()>;

    /// Terminal status of a flow that no longer has a checkpoint.
    async fn terminal_status(&self, flow_id: &FlowId) -> Result<Option<FlowStatus>>;

    /// Drain records committed so far, in commit order.
    async fn take_outbox(&self) -> Result<Vec<OutboundRecord>>;
}

#[derive(Default)]
struct StoreState {
    checkpoints: HashMap<FlowId, Vec<u8>>,
    terminal: HashMap<FlowId, FlowStatus>,
    outbox: Vec<OutboundRecord>,
}

/// In-memory store keeping encoded checkpoints.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    state: RwLock<StoreState>,
    codec: CheckpointCodec,
}

impl InMemoryCheckpointStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store compressing checkpoints with the given codec.
    #[must_use]
    pub fn with_codec(codec: CheckpointCodec) -> Self {
        Self {
            state: RwLock::default(),
            codec,
        }
    }

    /// Number of live checkpoints.
    pub async fn len(&self) -> usize {
        self.state.read().await.checkpoints.len()
    }

    /// Check if there are no live checkpoints.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, flow_id: &FlowId) -> Result<Option<Checkpoint>> {
        let state = self.state.read().await;
        state
            .checkpoints
            .get(flow_id)
            .map(|bytes| self.codec.decode(bytes))
            .transpose()
    }

    async fn put(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = self.codec.encode(checkpoint)?;
        self.state
            .write()
            .await
            .checkpoints
            .insert(checkpoint.flow_id.clone(), bytes);
        Ok(())
    }

    async fn delete(&self, flow_id: &FlowId) -> Result<()> {
        self.state.write().await.checkpoints.remove(flow_id);
        Ok(())
    }

    async fn commit(&self, commit: Commit) -> Result<()> {
        // encode before taking the lock so a codec failure changes nothing
        let encoded = match &commit.write {
            CheckpointWrite::Put(checkpoint) => Some(self.codec.encode(checkpoint)?),
            CheckpointWrite::Delete | CheckpointWrite::Keep => None,
        };

        let mut state = self.state.write().await;
        match (commit.write, encoded) {
            (CheckpointWrite::Put(_), Some(bytes)) => {
                state.checkpoints.insert(commit.flow_id.clone(), bytes);
            }
            (CheckpointWrite::Delete, _) => {
                state.checkpoints.remove(&commit.flow_id);
            }
            _ => {}
        }
        if let Some(status) = commit.terminal_status {
            state.terminal.insert(commit.flow_id, status);
        }
        state.outbox.extend(commit.records);
        Ok(())
    }

    async fn terminal_status(&self, flow_id: &FlowId) -> Result<Option<FlowStatus>> {
        Ok(self.state.read().await.terminal.get(flow_id).copied())
    }

    async fn take_outbox(&self) -> Result<Vec<OutboundRecord>> {
        Ok(std::mem::take(&mut self.state.write().await.outbox))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::FlowStatusRecord;
    use chrono::Utc;

    fn checkpoint(id: &str) -> Checkpoint {
        Checkpoint::initial(FlowId::from(id), "ping", Utc::now())
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryCheckpointStore::new();
        let cp = checkpoint("f-1");

        assert!(store.put(&cp).await.is_ok());
        let loaded = store.get(&cp.flow_id).await.ok().flatten();
        assert_eq!(loaded, Some(cp.clone()));

        assert!(store.delete(&cp.flow_id).await.is_ok());
        assert_eq!(store.get(&cp.flow_id).await.ok().flatten(), None);
    }

    #[tokio::test]
    async fn test_commit_publishes_records_with_checkpoint() {
        let store = InMemoryCheckpointStore::new();
        let cp = checkpoint("f-1");
        let record = OutboundRecord::FlowStatus(FlowStatusRecord::running(cp.flow_id.clone()));

        let committed = store
            .commit(Commit {
                flow_id: cp.flow_id.clone(),
                write: CheckpointWrite::Put(Box::new(cp.clone())),
                records: vec![record.clone()],
                terminal_status: None,
            })
            .await;
        assert!(committed.is_ok());

        assert_eq!(store.get(&cp.flow_id).await.ok().flatten(), Some(cp));
        assert_eq!(store.take_outbox().await.ok(), Some(vec![record]));
        assert_eq!(store.take_outbox().await.ok(), Some(vec![]));
    }

    #[tokio::test]
    async fn test_delete_commit_remembers_terminal_status() {
        let store = InMemoryCheckpointStore::new();
        let cp = checkpoint("f-1");
        assert!(store.put(&cp).await.is_ok());

        let committed = store
            .commit(Commit {
                flow_id: cp.flow_id.clone(),
                write: CheckpointWrite::Delete,
                records: Vec::new(),
                terminal_status: Some(FlowStatus::Completed),
            })
            .await;
        assert!(committed.is_ok());

        assert!(store.is_empty().await);
        assert_eq!(
            store.terminal_status(&cp.flow_id).await.ok().flatten(),
            Some(FlowStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_stored_bytes_are_not_aliased() {
        let store = InMemoryCheckpointStore::new();
        let mut cp = checkpoint("f-1");
        assert!(store.put(&cp).await.is_ok());
        cp.next_wakeup_token = 42;

        let loaded = store.get(&cp.flow_id).await.ok().flatten();
        assert_eq!(loaded.map(|c| c.next_wakeup_token), Some(0));
    }
}
