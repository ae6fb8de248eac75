//! Partitioned worker pool.
//!
//! Each inbound event is routed by a stable hash of its flow id to one worker
//! task, so a flow's checkpoint is only ever touched by one task at a time
//! while different flows are processed in parallel. A suspended flow holds no
//! task: the worker returns as soon as the checkpoint is committed.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::dispatcher::{ContinuationDispatcher, DispatchOutcome};
use crate::error::{Error, Result};
use crate::message::InboundEvent;
use crate::types::FlowId;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Per-partition queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Result of processing one event, reported by a worker.
#[derive(Debug)]
pub struct ProcessedEvent {
    pub flow_id: FlowId,
    pub partition: usize,
    pub result: Result<DispatchOutcome>,
}

/// Pool of worker tasks partitioned by flow id.
pub struct FlowWorkerPool {
    senders: Vec<mpsc::Sender<InboundEvent>>,
    handles: Vec<JoinHandle<()>>,
}

impl FlowWorkerPool {
    /// Spawn `partitions` workers. Must be called inside a tokio runtime.
    ///
    /// Returns the pool and the channel on which every processed event is
    /// reported.
    pub fn start(
        dispatcher: Arc<ContinuationDispatcher>,
        partitions: usize,
        capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<ProcessedEvent>) {
        let partitions = partitions.max(1);
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (senders, handles): (Vec<_>, Vec<_>) = (0..partitions)
            .map(|partition| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                let handle = tokio::spawn(worker_loop(
                    partition,
                    Arc::clone(&dispatcher),
                    rx,
                    results_tx.clone(),
                ));
                (tx, handle)
            })
            .unzip();
        info!(partitions, "Worker pool started");
        (Self { senders, handles }, results_rx)
    }

    /// Number of partitions.
    #[must_use]
    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    /// Partition a flow id maps to.
    #[must_use]
    pub fn partition_of(flow_id: &FlowId, partitions: usize) -> usize {
        let hash = flow_id
            .as_str()
            .bytes()
            .fold(FNV_OFFSET, |hash, byte| {
                (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
            });
        let partitions = u64::try_from(partitions.max(1)).unwrap_or(1);
        usize::try_from(hash % partitions).unwrap_or(0)
    }

    /// Queue an event on its flow's partition.
    ///
    /// # Errors
    ///
    /// Returns `Error::PoolClosed` if the worker has stopped.
    pub async fn submit(&self, event: InboundEvent) -> Result<()> {
        let partition = Self::partition_of(&event.flow_id, self.senders.len());
        let sender = self.senders.get(partition).ok_or(Error::PoolClosed)?;
        sender.send(event).await.map_err(|_| Error::PoolClosed)
    }

    /// Stop accepting events, let workers drain their queues, and join them.
    pub async fn shutdown(self) {
        drop(self.senders);
        let joined = join_all(self.handles).await;
        for (partition, result) in joined.into_iter().enumerate() {
            if let Err(e) = result {
                error!(partition, error = %e, "Worker task failed");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    partition: usize,
    dispatcher: Arc<ContinuationDispatcher>,
    mut events: mpsc::Receiver<InboundEvent>,
    results: mpsc::UnboundedSender<ProcessedEvent>,
) {
    debug!(partition, "Worker started");
    while let Some(event) = events.recv().await {
        let flow_id = event.flow_id.clone();
        let result = dispatcher.process(event).await;
        if let Err(e) = &result {
            error!(
                partition,
                flow_id = %flow_id,
                error = %e,
                retryable = e.is_retryable(),
                "Event processing failed"
            );
        }
        if results
            .send(ProcessedEvent {
                flow_id,
                partition,
                result,
            })
            .is_err()
        {
            debug!(partition, "Result receiver dropped");
        }
    }
    debug!(partition, "Worker stopped");
}
