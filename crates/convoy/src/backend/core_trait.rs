use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::batch::Batch;
use crate::error::CacheError;
use crate::sequence::{Position, SequenceId, Token};

/// Result of one native evaluation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalStatus {
    /// The batch was evaluated; logits for rows marked `wants_logits` are readable.
    Ok,
    /// No free cache slot for the batch. Recoverable once capacity is freed.
    NoCacheSlot,
    /// Unrecoverable failure with a native status code.
    Error(i32),
}

/// # Evaluator
///
/// The black-box autoregressive evaluation routine.
///
/// `evaluate` is the only place the scheduler suspends. Implementations receive the
/// batch by reference; they must not retain it past the call.
///
/// After `evaluate` returns [`EvalStatus::Ok`], [`read_logits`](Evaluator::read_logits)
/// must return the logits for every row marked `wants_logits`, until the next call to
/// `evaluate` overwrites them. The scheduler copies them out before releasing the next
/// batch, so implementations only ever need to keep the latest set.
#[async_trait]
pub trait Evaluator: Send + Sync + 'static {
    /// Evaluate every row of `batch`.
    async fn evaluate(&self, batch: &Batch) -> EvalStatus;

    /// Logits produced for batch row `index` by the most recent successful evaluation.
    fn read_logits(&self, index: usize) -> Option<Vec<f32>>;
}

#[async_trait]
impl<T> Evaluator for Arc<T>
where
    T: Evaluator + ?Sized,
{
    async fn evaluate(&self, batch: &Batch) -> EvalStatus {
        (**self).evaluate(batch).await
    }

    fn read_logits(&self, index: usize) -> Option<Vec<f32>> {
        (**self).read_logits(index)
    }
}

/// # KvCache
///
/// The shared key/value cache, addressed exclusively by sequence id and position.
///
/// The scheduler is the only caller and always calls from inside its state critical
/// section, so implementations need no synchronisation of their own. Calls are
/// expected to be fast compared to an evaluation.
pub trait KvCache: Send + 'static {
    /// Record that rows `range` of `sequence` now hold evaluated state.
    fn extend(&mut self, sequence: SequenceId, range: Range<Position>) -> Result<(), CacheError>;

    /// Copy the rows `0..up_to` of `source` into `destination`.
    fn duplicate_rows(
        &mut self,
        source: SequenceId,
        destination: SequenceId,
        up_to: Position,
    ) -> Result<(), CacheError>;

    /// Drop rows `from..to` of `sequence`. Absent rows are ignored.
    fn delete_rows(
        &mut self,
        sequence: SequenceId,
        from: Position,
        to: Position,
    ) -> Result<(), CacheError>;

    /// Serialise rows `range` of `sequence`.
    fn read_raw(&self, sequence: SequenceId, range: Range<Position>) -> Result<Vec<u8>, CacheError>;

    /// Restore rows previously produced by [`read_raw`](KvCache::read_raw) into
    /// `sequence`, returning how many rows were restored.
    fn write_raw(&mut self, sequence: SequenceId, bytes: &[u8]) -> Result<usize, CacheError>;

    /// Whether [`shift_rows`](KvCache::shift_rows) is implemented. Checked before any
    /// row is touched by a shift.
    fn can_shift(&self) -> bool {
        false
    }

    /// Move rows `from..to` of `sequence` back by `by` positions.
    fn shift_rows(
        &mut self,
        _sequence: SequenceId,
        _from: Position,
        _to: Position,
        _by: u32,
    ) -> Result<(), CacheError> {
        Err(CacheError::Unsupported("shift_rows"))
    }
}

impl<T> KvCache for Box<T>
where
    T: KvCache + ?Sized,
{
    fn extend(&mut self, sequence: SequenceId, range: Range<Position>) -> Result<(), CacheError> {
        (**self).extend(sequence, range)
    }

    fn duplicate_rows(
        &mut self,
        source: SequenceId,
        destination: SequenceId,
        up_to: Position,
    ) -> Result<(), CacheError> {
        (**self).duplicate_rows(source, destination, up_to)
    }

    fn delete_rows(&mut self, sequence: SequenceId, from: Position, to: Position) -> Result<(), CacheError> {
        (**self).delete_rows(sequence, from, to)
    }

    fn read_raw(&self, sequence: SequenceId, range: Range<Position>) -> Result<Vec<u8>, CacheError> {
        (**self).read_raw(sequence, range)
    }

    fn write_raw(&mut self, sequence: SequenceId, bytes: &[u8]) -> Result<usize, CacheError> {
        (**self).write_raw(sequence, bytes)
    }

    fn can_shift(&self) -> bool {
        (**self).can_shift()
    }

    fn shift_rows(
        &mut self,
        sequence: SequenceId,
        from: Position,
        to: Position,
        by: u32,
    ) -> Result<(), CacheError> {
        (**self).shift_rows(sequence, from, to, by)
    }
}

/// # Sampler
///
/// Picks the next token from a conversation's logits. `recent` holds the
/// conversation's tokens so far, oldest first.
///
/// Any `FnMut(&[f32], &[Token]) -> Token` closure is a sampler.
pub trait Sampler {
    fn select(&mut self, logits: &[f32], recent: &[Token]) -> Token;
}

impl<F> Sampler for F
where
    F: FnMut(&[f32], &[Token]) -> Token,
{
    fn select(&mut self, logits: &[f32], recent: &[Token]) -> Token {
        self(logits, recent)
    }
}
