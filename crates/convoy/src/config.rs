//! # Configuration
//!
//! Plain serde-friendly settings for the [`Scheduler`](crate::scheduler::Scheduler)
//! and the [`InferWorker`](crate::core::worker::InferWorker). Every field has a
//! default, so partial documents deserialize.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Default number of entries one batch holds.
pub const DEFAULT_BATCH_CAPACITY: usize = 512;

/// Default interval after which an idle worker checks for queued tokens anyway.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum entries per batch. Both buffers are allocated with this capacity.
    pub batch_capacity: usize,

    /// Maximum tokens (committed plus pending) a single conversation may hold.
    pub context_length: Option<usize>,

    /// Ceiling on the number of sequence ids ever issued.
    pub max_sequences: Option<u32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            context_length: None,
            max_sequences: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_batch_capacity(mut self, batch_capacity: usize) -> Self {
        self.batch_capacity = batch_capacity;
        self
    }

    pub fn with_context_length(mut self, context_length: usize) -> Self {
        self.context_length = Some(context_length);
        self
    }

    pub fn with_max_sequences(mut self, max_sequences: u32) -> Self {
        self.max_sequences = Some(max_sequences);
        self
    }

    /// Reject settings no scheduler can run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_capacity == 0 {
            return Err(SchedulerError::InvalidConfig {
                reason: "batch_capacity must be at least 1".to_string(),
            });
        }
        if self.context_length == Some(0) {
            return Err(SchedulerError::InvalidConfig {
                reason: "context_length must be at least 1 when set".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// How long the worker sleeps without a notification before checking for work.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WorkerConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.batch_capacity, 512);
        assert!(config.context_length.is_none());
        assert!(config.max_sequences.is_none());
        assert!(config.validate().is_ok());

        assert_eq!(WorkerConfig::default().poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let err = SchedulerConfig::default().with_batch_capacity(0).validate().unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig { .. }));
    }

    #[test]
    fn test_zero_context_is_rejected() {
        let err = SchedulerConfig::default().with_context_length(0).validate().unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig { .. }));
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: SchedulerConfig = serde_json::from_str(r#"{ "context_length": 2048 }"#).unwrap();
        assert_eq!(config.batch_capacity, DEFAULT_BATCH_CAPACITY);
        assert_eq!(config.context_length, Some(2048));

        let worker: WorkerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(worker, WorkerConfig::default());
    }

    #[test]
    fn test_round_trips_through_json() {
        let config = SchedulerConfig::default()
            .with_batch_capacity(64)
            .with_max_sequences(16);
        let json = serde_json::to_string(&config).unwrap();
        let back: SchedulerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
