//! JSON-lines event driver.
//!
//! Feeds enveloped inbound events through the worker pool, loops
//! self-addressed wakeups back in, and writes every other committed record
//! as an enveloped JSON line.

use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use ferry_flow::{
    codec, CheckpointCodec, CheckpointStore, ContinuationDispatcher, EngineConfig, FlowWorkerPool,
    InMemoryCheckpointStore, InboundEvent, SystemClock,
};
use tracing::{debug, info, warn};

use crate::flows::builtin_registry;

/// Counters reported when a run finishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Events processed, including fed-back wakeups.
    pub processed: usize,
    /// Events whose processing returned an engine error.
    pub failed: usize,
    /// Lines that could not be decoded.
    pub rejected: usize,
    /// Records written to the output.
    pub emitted: usize,
}

/// Decode every non-blank line; undecodable lines are counted and skipped.
fn read_events(input: impl BufRead, summary: &mut RunSummary) -> Result<Vec<InboundEvent>> {
    let mut events = Vec::new();
    for (index, line) in input.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", index + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        match codec::decode::<InboundEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping undecodable event");
                summary.rejected += 1;
            }
        }
    }
    Ok(events)
}

/// Process `input` to completion and write records to `output`.
///
/// # Errors
///
/// Returns an error if the input cannot be read, the output cannot be
/// written, or the store fails.
pub async fn run(
    config: &EngineConfig,
    input: impl BufRead,
    mut output: impl Write,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    let events = read_events(input, &mut summary)?;
    info!(events = events.len(), rejected = summary.rejected, "Events loaded");

    let store = Arc::new(InMemoryCheckpointStore::with_codec(CheckpointCodec::new(
        config.checkpoint_compression_level,
    )));
    let dispatcher = Arc::new(ContinuationDispatcher::new(
        store.clone(),
        Arc::new(builtin_registry()),
        Arc::new(SystemClock),
        config,
    ));
    let (pool, mut results) = FlowWorkerPool::start(
        dispatcher,
        config.worker_partitions,
        ferry_flow::worker::DEFAULT_QUEUE_CAPACITY,
    );

    let mut in_flight = 0usize;
    for event in events {
        pool.submit(event).await?;
        in_flight += 1;
    }

    while in_flight > 0 {
        let Some(processed) = results.recv().await else {
            break;
        };
        in_flight -= 1;
        summary.processed += 1;
        match &processed.result {
            Ok(outcome) => {
                for anomaly in &outcome.anomalies {
                    debug!(flow_id = %processed.flow_id, ?anomaly, "Anomaly");
                }
            }
            Err(_) => summary.failed += 1,
        }

        for record in store.take_outbox().await? {
            if let Some(event) = record.as_self_addressed() {
                pool.submit(event).await?;
                in_flight += 1;
            } else {
                writeln!(output, "{}", codec::encode(&record)?)
                    .context("failed to write record")?;
                summary.emitted += 1;
            }
        }
    }

    pool.shutdown().await;
    output.flush().context("failed to flush output")?;
    info!(
        processed = summary.processed,
        failed = summary.failed,
        emitted = summary.emitted,
        "Run finished"
    );
    Ok(summary)
}
