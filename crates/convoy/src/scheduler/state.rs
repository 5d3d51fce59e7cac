//! Bookkeeping guarded by the scheduler's state lock.
//!
//! Every method here runs inside one critical section and either completes or
//! leaves the state untouched, with the exception of cache failures part way through
//! a commit or a shift, after which the scheduler is faulted.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::conversation::ConversationState;
use super::snapshot::ConversationSnapshot;
use crate::backend::KvCache;
use crate::config::SchedulerConfig;
use crate::core::Epoch;
use crate::core::batch::Batch;
use crate::core::buffers::DoubleBuffer;
use crate::error::{CacheError, Operation, Result, SchedulerError};
use crate::sequence::{Position, SequenceAllocator, SequenceId, Token};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Running,
    Disposed,
    Faulted(String),
}

/// Per-sequence record in the scheduler's arena.
#[derive(Debug, Clone, Default)]
pub(crate) struct SequenceState {
    /// Positions present in the cache.
    pub committed: usize,
    /// Entries queued in a batch but not yet evaluated.
    pub pending: usize,
    /// Stamp of the latest enqueue, `None` until the first prompt.
    pub queued: Option<Epoch>,
    /// Committed tokens followed by pending ones.
    pub history: Vec<Token>,
    pub logits: Option<Arc<[f32]>>,
}

impl SequenceState {
    fn token_count(&self) -> usize {
        self.committed + self.pending
    }
}

pub(crate) struct SchedulerState {
    config: SchedulerConfig,
    buffers: DoubleBuffer,
    epoch: Epoch,
    allocator: SequenceAllocator,
    sequences: HashMap<SequenceId, SequenceState>,
    cache: Box<dyn KvCache>,
    lifecycle: Lifecycle,
}

/// Positions are bounded by `u32`; every count stored here was validated against
/// that bound when it was queued.
fn position(count: usize) -> Position {
    Position(u32::try_from(count).unwrap_or(u32::MAX))
}

impl SchedulerState {
    pub fn new(config: SchedulerConfig, cache: Box<dyn KvCache>) -> Self {
        Self {
            buffers: DoubleBuffer::new(config.batch_capacity),
            epoch: Epoch::INITIAL,
            allocator: SequenceAllocator::new(config.max_sequences),
            sequences: HashMap::new(),
            cache,
            lifecycle: Lifecycle::Running,
            config,
        }
    }

    pub fn ensure_running(&self) -> Result<()> {
        match &self.lifecycle {
            Lifecycle::Running => Ok(()),
            Lifecycle::Disposed => Err(SchedulerError::SchedulerDisposed),
            Lifecycle::Faulted(reason) => Err(SchedulerError::SchedulerFaulted {
                reason: reason.clone(),
            }),
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn advance_epoch(&mut self) -> Epoch {
        self.epoch.advance()
    }

    pub fn buffers(&self) -> &DoubleBuffer {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut DoubleBuffer {
        &mut self.buffers
    }

    pub fn batch_capacity(&self) -> usize {
        self.config.batch_capacity
    }

    pub fn live_sequences(&self) -> usize {
        self.sequences.len()
    }

    pub fn fault(&mut self, reason: String) {
        if self.lifecycle == Lifecycle::Running {
            self.lifecycle = Lifecycle::Faulted(reason);
        }
    }

    /// The epoch the filling buffer will be evaluated under.
    ///
    /// While another batch is checked out or parked ahead of the filling buffer, that
    /// batch must succeed first, so the filling buffer's tokens are only evaluated once
    /// the epoch has moved past `current + 1`.
    fn enqueue_stamp(&self) -> Epoch {
        if self.buffers.has_batch_ahead() {
            self.epoch.next()
        } else {
            self.epoch
        }
    }

    fn get(&self, sequence: SequenceId) -> Result<&SequenceState> {
        self.sequences
            .get(&sequence)
            .ok_or(SchedulerError::UseAfterDispose { sequence })
    }

    fn get_mut(&mut self, sequence: SequenceId) -> Result<&mut SequenceState> {
        self.sequences
            .get_mut(&sequence)
            .ok_or(SchedulerError::UseAfterDispose { sequence })
    }

    pub fn sequence(&self, sequence: SequenceId) -> Result<&SequenceState> {
        self.get(sequence)
    }

    pub fn phase(&self, sequence: SequenceId) -> ConversationState {
        match self.sequences.get(&sequence) {
            None => ConversationState::Disposed,
            Some(SequenceState { queued: None, .. }) => ConversationState::Fresh,
            Some(SequenceState { queued: Some(queued), .. }) if self.epoch.has_evaluated(*queued) => {
                ConversationState::Sampleable
            }
            Some(_) => ConversationState::Prompting,
        }
    }

    /// Fail unless `sequence` is `Fresh` or `Sampleable`.
    fn ensure_settled(&self, sequence: SequenceId, operation: Operation) -> Result<&SequenceState> {
        let record = self.get(sequence)?;
        match self.phase(sequence) {
            ConversationState::Fresh | ConversationState::Sampleable => {
                debug_assert_eq!(record.pending, 0);
                Ok(record)
            }
            state => Err(SchedulerError::InvalidStateForOperation {
                sequence,
                operation,
                state,
            }),
        }
    }

    pub fn create(&mut self) -> Result<SequenceId> {
        let sequence = self.allocator.next()?;
        self.sequences.insert(sequence, SequenceState::default());
        Ok(sequence)
    }

    /// Queue `tokens` at consecutive positions for every sequence in `owners`, only the
    /// last one asking for logits. Either every token is queued or none is.
    pub fn prompt(&mut self, owners: &[SequenceId], tokens: &[Token]) -> Result<()> {
        let Some((&first, rest)) = owners.split_first() else {
            return Ok(());
        };
        let lead = self.get(first)?;
        for other in rest {
            let record = self.get(*other)?;
            if record.committed != lead.committed || record.pending != lead.pending {
                return Err(SchedulerError::DivergentHistory {
                    reason: format!("conversations {first} and {other} are at different positions"),
                });
            }
            if record.history != lead.history {
                return Err(SchedulerError::DivergentHistory {
                    reason: format!("conversations {first} and {other} hold different tokens"),
                });
            }
        }
        if tokens.is_empty() {
            return Ok(());
        }

        let start = lead.token_count();
        let requested = start + tokens.len();
        let limit = self
            .config
            .context_length
            .unwrap_or(u32::MAX as usize)
            .min(u32::MAX as usize);
        if requested > limit {
            return Err(SchedulerError::ContextOverflow {
                sequence: first,
                requested,
                limit,
            });
        }
        self.buffers.filling().ensure_room(tokens.len())?;

        let stamp = self.enqueue_stamp();
        let last = tokens.len() - 1;
        let batch = self.buffers.filling_mut();
        for (offset, token) in tokens.iter().enumerate() {
            batch.append(*token, position(start + offset), owners, offset == last)?;
        }

        for owner in owners {
            let record = self.get_mut(*owner)?;
            record.history.extend_from_slice(tokens);
            record.pending += tokens.len();
            record.queued = Some(record.queued.map_or(stamp, |queued| queued.max(stamp)));
        }
        Ok(())
    }

    /// Captured logits of a sampleable sequence, with its history.
    pub fn logits(&self, sequence: SequenceId) -> Result<(Arc<[f32]>, Vec<Token>)> {
        let record = self.get(sequence)?;
        let state = self.phase(sequence);
        if state != ConversationState::Sampleable {
            return Err(SchedulerError::InvalidStateForOperation {
                sequence,
                operation: Operation::Sample,
                state,
            });
        }
        let logits = record.logits.clone().ok_or(SchedulerError::LogitsUnavailable {
            sequence,
            epoch: self.epoch,
        })?;
        Ok((logits, record.history.clone()))
    }

    pub fn fork(&mut self, parent: SequenceId) -> Result<SequenceId> {
        let record = self.ensure_settled(parent, Operation::Fork)?.clone();
        let child = self.allocator.next()?;
        self.cache
            .duplicate_rows(parent, child, position(record.committed))?;
        self.sequences.insert(child, record);
        Ok(child)
    }

    /// Truncate `sequence` to its first `count` committed tokens.
    pub fn rewind(&mut self, sequence: SequenceId, count: usize) -> Result<()> {
        let committed = self.ensure_settled(sequence, Operation::Rewind)?.committed;
        if count > committed {
            return Err(SchedulerError::InvalidRewindLength {
                sequence,
                requested: count,
                committed,
            });
        }
        if count == committed {
            return Ok(());
        }

        self.cache
            .delete_rows(sequence, position(count), position(committed))?;
        let record = self.get_mut(sequence)?;
        record.committed = count;
        record.history.truncate(count);
        record.logits = None;
        record.queued = None;
        Ok(())
    }

    /// Drop `count` committed tokens after the first `keep`, moving the rest back.
    pub fn shift_left(&mut self, sequence: SequenceId, count: usize, keep: usize) -> Result<()> {
        let committed = self.ensure_settled(sequence, Operation::ShiftLeft)?.committed;
        if keep + count > committed {
            return Err(SchedulerError::InvalidShiftRange {
                sequence,
                keep,
                count,
                committed,
            });
        }
        if count == 0 {
            return Ok(());
        }
        if !self.cache.can_shift() {
            return Err(CacheError::Unsupported("shift_rows").into());
        }

        let tail = keep + count;
        self.cache
            .delete_rows(sequence, position(keep), position(tail))?;
        if let Err(e) = self.cache.shift_rows(
            sequence,
            position(tail),
            position(committed),
            position(count).0,
        ) {
            // the window is already gone, so the cache no longer matches the record
            let reason = format!("shifting {sequence} failed after deleting rows: {e}");
            self.fault(reason.clone());
            return Err(SchedulerError::SchedulerFaulted { reason });
        }

        let record = self.get_mut(sequence)?;
        record.committed -= count;
        record.history.drain(keep..tail);
        record.logits = None;
        record.queued = None;
        Ok(())
    }

    /// A sampleable sequence is saved with its logits.
    pub fn snapshot(&self, sequence: SequenceId) -> Result<ConversationSnapshot> {
        let record = self.ensure_settled(sequence, Operation::Save)?;
        let cache = self
            .cache
            .read_raw(sequence, Position(0)..position(record.committed))?;
        let snapshot = ConversationSnapshot::new(
            record.committed,
            record.history[..record.committed].to_vec(),
            cache,
        )?;
        Ok(match (&record.logits, self.phase(sequence)) {
            (Some(logits), ConversationState::Sampleable) => snapshot.with_logits(logits.to_vec()),
            _ => snapshot,
        })
    }

    pub fn restore(&mut self, snapshot: &ConversationSnapshot) -> Result<SequenceId> {
        let committed = snapshot.committed();
        let limit = self.config.context_length.unwrap_or(u32::MAX as usize);
        if committed > limit {
            return Err(SchedulerError::InvalidSnapshot {
                reason: format!("{committed} committed tokens exceed the context length {limit}"),
            });
        }

        let sequence = self.allocator.next()?;
        let rows = self.cache.write_raw(sequence, snapshot.cache())?;
        if rows != committed {
            if let Err(e) = self.cache.delete_rows(sequence, Position(0), Position(u32::MAX)) {
                warn!(%sequence, error = %e, "failed to drop rows of rejected snapshot");
            }
            return Err(SchedulerError::InvalidSnapshot {
                reason: format!("cache blob holds {rows} rows but {committed} tokens are committed"),
            });
        }

        // saved logits make the conversation sampleable under any epoch of this scheduler
        let logits: Option<Arc<[f32]>> = snapshot.logits().map(Arc::from);
        let queued = logits.as_ref().map(|_| self.epoch.previous());
        self.sequences.insert(
            sequence,
            SequenceState {
                committed,
                history: snapshot.history().to_vec(),
                queued,
                logits,
                ..SequenceState::default()
            },
        );
        Ok(sequence)
    }

    /// Forget `sequence` and drop its committed rows. Entries it still has queued are
    /// cleaned up when their batch commits.
    pub fn release(&mut self, sequence: SequenceId) -> Result<()> {
        let Some(record) = self.sequences.remove(&sequence) else {
            return Ok(());
        };
        self.cache
            .delete_rows(sequence, Position(0), position(record.committed))?;
        Ok(())
    }

    /// Apply a successfully evaluated batch: extend the cache for every owner,
    /// promote pending tokens to committed and store captured logits.
    pub fn commit(&mut self, batch: &Batch, logits: Vec<(usize, Arc<[f32]>)>) -> Result<()> {
        let mut orphans: HashMap<SequenceId, Position> = HashMap::new();

        for entry in batch.entries() {
            for &sequence in entry.sequences {
                let Some(record) = self.sequences.get_mut(&sequence) else {
                    let end = orphans.entry(sequence).or_default();
                    *end = (*end).max(entry.position.next());
                    continue;
                };
                self.cache
                    .extend(sequence, entry.position..entry.position.next())?;
                record.committed += 1;
                record.pending = record.pending.saturating_sub(1);
            }
        }

        for (index, row) in logits {
            for sequence in batch.sequences(index) {
                if let Some(record) = self.sequences.get_mut(sequence) {
                    record.logits = Some(row.clone());
                }
            }
        }

        for (sequence, end) in orphans {
            debug!(%sequence, rows = end.0, "dropping rows of disposed conversation");
            self.cache.delete_rows(sequence, Position(0), end)?;
        }
        Ok(())
    }

    /// Drop every sequence and its rows. Later calls fail with `SchedulerDisposed`.
    ///
    /// A batch checked out to the evaluator stays checked out; `infer` returns it.
    pub fn dispose(&mut self) -> Result<()> {
        if self.lifecycle == Lifecycle::Disposed {
            return Ok(());
        }
        self.lifecycle = Lifecycle::Disposed;
        self.buffers.filling_mut().clear();

        let mut first_error = None;
        for (sequence, record) in self.sequences.drain() {
            if let Err(e) = self
                .cache
                .delete_rows(sequence, Position(0), position(record.token_count()))
            {
                warn!(%sequence, error = %e, "failed to drop rows while disposing");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
