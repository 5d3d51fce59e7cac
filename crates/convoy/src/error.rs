//! # Errors
//!
//! Every fallible operation in the crate returns [`SchedulerError`]. Errors fall into
//! three classes, reported by [`SchedulerError::kind`]:
//!
//! - [`ErrorKind::Backpressure`] - the shared resource is saturated. Nothing was
//!   changed; free capacity (run `infer`, dispose or rewind conversations) and retry.
//! - [`ErrorKind::Misuse`] - the caller asked for something illegal in the current
//!   state. Nothing was changed and retrying as-is will fail again.
//! - [`ErrorKind::Fatal`] - the scheduler can no longer make progress.

use std::fmt;

use thiserror::Error;

use crate::core::Epoch;
use crate::scheduler::ConversationState;
use crate::sequence::{Position, SequenceId};

/// Convenience alias used throughout the crate.
pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;

/// How the caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Recoverable; free capacity and retry.
    Backpressure,
    /// Caller misuse; state is unchanged.
    Misuse,
    /// Terminal for the scheduler.
    Fatal,
}

/// Conversation operations that are only legal in some states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Prompt,
    Sample,
    Fork,
    Rewind,
    ShiftLeft,
    Save,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Prompt => "prompt",
            Operation::Sample => "sample",
            Operation::Fork => "fork",
            Operation::Rewind => "rewind",
            Operation::ShiftLeft => "shift",
            Operation::Save => "save",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("batch is full: {requested} tokens requested, {available} of {capacity} slots free")]
    CapacityExceeded {
        requested: usize,
        available: usize,
        capacity: usize,
    },

    #[error("conversation {sequence} would grow to {requested} tokens, context holds {limit}")]
    ContextOverflow {
        sequence: SequenceId,
        requested: usize,
        limit: usize,
    },

    #[error("inference cancelled at epoch {epoch}, queued tokens were kept")]
    Cancelled { epoch: Epoch },

    #[error("conversation {sequence} has been disposed")]
    UseAfterDispose { sequence: SequenceId },

    #[error("cannot {operation} conversation {sequence} while it is {state}")]
    InvalidStateForOperation {
        sequence: SequenceId,
        operation: Operation,
        state: ConversationState,
    },

    #[error("cannot rewind conversation {sequence} to {requested} tokens, {committed} are committed")]
    InvalidRewindLength {
        sequence: SequenceId,
        requested: usize,
        committed: usize,
    },

    #[error("cannot shift conversation {sequence} by {count} after {keep} kept tokens, {committed} are committed")]
    InvalidShiftRange {
        sequence: SequenceId,
        keep: usize,
        count: usize,
        committed: usize,
    },

    #[error("conversations passed to a shared prompt must have identical history: {reason}")]
    DivergentHistory { reason: String },

    #[error("invalid scheduler configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("scheduler has been disposed")]
    SchedulerDisposed,

    #[error("sequence id space exhausted after {issued} ids")]
    SequenceSpaceExhausted { issued: u64 },

    #[error("evaluation of {tokens} tokens failed at epoch {epoch} with code {code}")]
    EvaluationFailed { epoch: Epoch, tokens: usize, code: i32 },

    #[error("scheduler faulted: {reason}")]
    SchedulerFaulted { reason: String },

    #[error("no logits were captured for conversation {sequence} at epoch {epoch}")]
    LogitsUnavailable { sequence: SequenceId, epoch: Epoch },

    #[error("invalid conversation snapshot: {reason}")]
    InvalidSnapshot { reason: String },

    #[error("kv cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedulerError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::CapacityExceeded { .. }
            | SchedulerError::ContextOverflow { .. }
            | SchedulerError::Cancelled { .. } => ErrorKind::Backpressure,

            SchedulerError::UseAfterDispose { .. }
            | SchedulerError::InvalidStateForOperation { .. }
            | SchedulerError::InvalidRewindLength { .. }
            | SchedulerError::InvalidShiftRange { .. }
            | SchedulerError::DivergentHistory { .. }
            | SchedulerError::InvalidConfig { .. }
            | SchedulerError::SchedulerDisposed => ErrorKind::Misuse,

            SchedulerError::SequenceSpaceExhausted { .. }
            | SchedulerError::EvaluationFailed { .. }
            | SchedulerError::SchedulerFaulted { .. }
            | SchedulerError::LogitsUnavailable { .. }
            | SchedulerError::InvalidSnapshot { .. }
            | SchedulerError::Cache(_)
            | SchedulerError::Io(_) => ErrorKind::Fatal,
        }
    }

    /// `true` when retrying the same call later can succeed without changing anything else
    /// than freeing capacity.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Backpressure
    }
}

/// Errors reported by a [`KvCache`](crate::backend::KvCache) collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("sequence {sequence} has no row at position {position}")]
    MissingRow {
        sequence: SequenceId,
        position: Position,
    },

    #[error("sequence {sequence} already has a row at position {position}")]
    RowOccupied {
        sequence: SequenceId,
        position: Position,
    },

    #[error("malformed cache blob for sequence {sequence}: {reason}")]
    MalformedBlob { sequence: SequenceId, reason: String },

    #[error("operation not supported by this cache: {0}")]
    Unsupported(&'static str),
}
