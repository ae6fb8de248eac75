//! Engine configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tunables of the flow pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum time between sends of a Transient-failed external request.
    pub external_resend_window_ms: u64,
    /// Retries allowed for one external request before escalation.
    pub max_external_retries: u32,
    /// TTL attached to external requests that do not name one.
    pub default_external_ttl_seconds: u64,
    /// Minimum age of an unacknowledged session message before it is resent.
    pub session_resend_window_ms: u64,
    /// How far past the next expected sequence number a peer message may be
    /// buffered.
    pub session_max_lookahead: u64,
    /// Number of worker tasks flows are partitioned across.
    pub worker_partitions: usize,
    /// zstd level used for checkpoint bytes.
    pub checkpoint_compression_level: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            external_resend_window_ms: 5_000,
            max_external_retries: 5,
            default_external_ttl_seconds: 300,
            session_resend_window_ms: 30_000,
            session_max_lookahead: 1_024,
            worker_partitions: 4,
            checkpoint_compression_level: 3,
        }
    }
}

impl EngineConfig {
    /// Check every field is usable.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.external_resend_window_ms == 0 {
            return Err(Error::invalid_config(
                "external_resend_window_ms must be greater than zero",
            ));
        }
        if self.session_resend_window_ms == 0 {
            return Err(Error::invalid_config(
                "session_resend_window_ms must be greater than zero",
            ));
        }
        if self.session_max_lookahead == 0 {
            return Err(Error::invalid_config(
                "session_max_lookahead must be greater than zero",
            ));
        }
        if self.worker_partitions == 0 {
            return Err(Error::invalid_config(
                "worker_partitions must be at least 1",
            ));
        }
        if !(1..=21).contains(&self.checkpoint_compression_level) {
            return Err(Error::invalid_config(format!(
                "checkpoint_compression_level must be within 1..=21, got {}",
                self.checkpoint_compression_level
            )));
        }
        Ok(())
    }

    /// External resend window as a duration.
    #[must_use]
    pub fn external_resend_window(&self) -> Duration {
        millis(self.external_resend_window_ms)
    }

    /// Session resend window as a duration.
    #[must_use]
    pub fn session_resend_window(&self) -> Duration {
        millis(self.session_resend_window_ms)
    }
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}
