//! # Scheduler
//!
//! The [`Scheduler`] lets many [`Conversation`]s share one evaluation context. Each
//! conversation queues tokens into a shared batch; a single [`Scheduler::infer`] call
//! evaluates everything queued so far in one evaluator call and makes the results
//! visible to every conversation involved.
//!
//! ## Double buffering
//!
//! Two batches exist at all times. `infer` checks out the filling batch and installs
//! the empty idle one in its place before suspending on the evaluator, so other tasks
//! keep prompting conversations while an evaluation is in flight. Their tokens go to
//! the next `infer` call.
//!
//! ## Epochs
//!
//! The scheduler epoch starts at 1 and advances once per successful evaluation. A
//! conversation records the epoch its tokens will be evaluated under; it may sample
//! once the scheduler epoch has moved past that stamp.
//!
//! ## Failure handling
//!
//! | Evaluator result | Queued tokens | Epoch | `infer` returns |
//! |------------------|---------------|-------|-----------------|
//! | `Ok`             | committed     | +1    | `Ok(DecodeStatus::Ok)` |
//! | `NoCacheSlot`    | kept, retried next call | unchanged | `Ok(DecodeStatus::NoCacheSlot)` |
//! | cancelled        | kept, retried next call | unchanged | `Err(Cancelled)` |
//! | `Error(code)`    | kept          | unchanged | `Err(EvaluationFailed)`, scheduler faulted |
//!
//! A cache failure while committing a batch, or while moving rows after a shift has
//! already deleted some, also faults the scheduler.

use std::mem;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::backend::{EvalStatus, Evaluator, KvCache};
use crate::communication::{InferOutcome, InferStatus, OutcomeStream, OutcomeSubscribers};
use crate::config::SchedulerConfig;
use crate::core::Epoch;
use crate::core::batch::Batch;
use crate::error::{Result, SchedulerError};
use crate::sequence::Token;

mod conversation;
mod snapshot;
mod state;

pub use conversation::{Conversation, ConversationState};
pub use snapshot::{ConversationSnapshot, SNAPSHOT_MAGIC};

use state::{Lifecycle, SchedulerState};

/// Result of an `infer` call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The batch was evaluated (or nothing was queued).
    Ok,
    /// The evaluator had no free cache slot. Everything queued is kept; free cache
    /// space by disposing or rewinding conversations and call `infer` again.
    NoCacheSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    epoch: Epoch,
    /// Disposed or faulted; no further epochs will be published.
    halted: bool,
}

pub(crate) struct Shared {
    id: Uuid,
    state: Mutex<SchedulerState>,
    /// Serialises `infer` calls; at most one evaluation is in flight.
    infer_lock: tokio::sync::Mutex<()>,
    evaluator: Arc<dyn Evaluator>,
    work_notifier: Arc<Notify>,
    progress: watch::Sender<Progress>,
    subscribers: OutcomeSubscribers,
}

impl Shared {
    fn halt(&self) {
        self.progress.send_modify(|progress| progress.halted = true);
    }

    async fn wait_for_epoch(&self, target: Epoch) -> Result<Epoch> {
        let mut receiver = self.progress.subscribe();
        let progress = *receiver
            .wait_for(|progress| progress.halted || progress.epoch >= target)
            .await
            .map_err(|_| SchedulerError::SchedulerDisposed)?;
        if progress.epoch >= target {
            return Ok(progress.epoch);
        }
        self.state.lock().ensure_running()?;
        Err(SchedulerError::SchedulerDisposed)
    }
}

/// Returns a checked out batch to the double buffer unless it was committed.
///
/// Dropping an `infer` future mid-evaluation drops this guard, so the queued tokens
/// survive exactly like an explicit cancellation.
struct InFlight<'a> {
    shared: &'a Shared,
    batch: Batch,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(shared: &'a Shared, batch: Batch) -> Self {
        Self {
            shared,
            batch,
            armed: true,
        }
    }

    fn batch(&self) -> &Batch {
        &self.batch
    }

    /// Disarm the guard and hand the batch over for committing.
    fn take(mut self) -> Batch {
        self.armed = false;
        mem::replace(&mut self.batch, Batch::with_capacity(0))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            let batch = mem::replace(&mut self.batch, Batch::with_capacity(0));
            self.shared.state.lock().buffers_mut().abort_evaluation(batch);
        }
    }
}

/// # Scheduler
///
/// Owns the evaluator, the KV cache, the epoch, the sequence allocator, both batches
/// and the bookkeeping of every conversation.
///
/// `Scheduler` is a cheap handle: clones share the same state, so one clone can run
/// [`infer`](Scheduler::infer) in a background task (see
/// [`InferWorker`](crate::core::worker::InferWorker)) while others create and prompt
/// conversations.
///
/// ## Example
///
/// ```ignore
/// let scheduler = Scheduler::new(evaluator, MemoryKvCache::new(), SchedulerConfig::default())?;
/// let a = scheduler.create()?;
/// let b = scheduler.create()?;
/// a.prompt(&[Token(1), Token(2), Token(3)])?;
/// b.prompt(&[Token(7), Token(8)])?;
///
/// // one evaluator call for all five tokens
/// scheduler.infer(&CancellationToken::new()).await?;
/// let next = a.sample(&mut GreedySampler)?;
/// ```
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.shared.id)
            .field("epoch", &self.epoch())
            .finish()
    }
}

impl Scheduler {
    /// Create a scheduler driving `evaluator` over `cache`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConfig`] if `config` does not validate.
    pub fn new<E, K>(evaluator: E, cache: K, config: SchedulerConfig) -> Result<Self>
    where
        E: Evaluator,
        K: KvCache,
    {
        config.validate()?;
        let id = Uuid::new_v4();
        debug!(scheduler = %id, capacity = config.batch_capacity, "creating scheduler");

        let (progress, _) = watch::channel(Progress {
            epoch: Epoch::INITIAL,
            halted: false,
        });
        let shared = Shared {
            id,
            state: Mutex::new(SchedulerState::new(config, Box::new(cache))),
            infer_lock: tokio::sync::Mutex::new(()),
            evaluator: Arc::new(evaluator),
            work_notifier: Arc::new(Notify::new()),
            progress,
            subscribers: OutcomeSubscribers::default(),
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Unique id of this scheduler, attached to its log records.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn epoch(&self) -> Epoch {
        self.shared.state.lock().epoch()
    }

    /// Tokens queued and not yet evaluated, excluding a batch currently being evaluated.
    pub fn batched_token_count(&self) -> usize {
        self.shared.state.lock().buffers().pending_tokens()
    }

    pub fn batch_capacity(&self) -> usize {
        self.shared.state.lock().batch_capacity()
    }

    /// Conversations created or loaded and not yet disposed.
    pub fn conversation_count(&self) -> usize {
        self.shared.state.lock().live_sequences()
    }

    pub fn is_disposed(&self) -> bool {
        *self.shared.state.lock().lifecycle() == Lifecycle::Disposed
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self.shared.state.lock().lifecycle(), Lifecycle::Faulted(_))
    }

    /// Start a new, empty conversation.
    pub fn create(&self) -> Result<Conversation> {
        let sequence = {
            let mut state = self.shared.state.lock();
            state.ensure_running()?;
            state.create()?
        };
        debug!(scheduler = %self.shared.id, %sequence, "created conversation");
        Ok(Conversation::new(sequence, self.shared.clone()))
    }

    /// Recreate a conversation from a file written by [`Conversation::save`].
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Conversation> {
        let snapshot = ConversationSnapshot::read_from(path)?;
        self.load_state(&snapshot)
    }

    /// Recreate a conversation from an in-memory snapshot.
    ///
    /// The conversation gets a fresh sequence id. A snapshot saved while
    /// [`Sampleable`](ConversationState::Sampleable) carries its logits and loads
    /// sampleable, so the next `sample` picks the token the saved conversation would
    /// have picked. Any other snapshot loads [`Fresh`](ConversationState::Fresh).
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidSnapshot`] if the snapshot exceeds the context length
    /// or its cache blob does not hold exactly the committed rows.
    pub fn load_state(&self, snapshot: &ConversationSnapshot) -> Result<Conversation> {
        let sequence = {
            let mut state = self.shared.state.lock();
            state.ensure_running()?;
            state.restore(snapshot)?
        };
        debug!(
            scheduler = %self.shared.id,
            %sequence,
            tokens = snapshot.committed(),
            "loaded conversation"
        );
        Ok(Conversation::new(sequence, self.shared.clone()))
    }

    /// Queue `tokens` once for several conversations with identical history.
    ///
    /// Each token occupies a single batch entry owned by every conversation, so a
    /// common prefix is evaluated once.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::DivergentHistory`] if the conversations differ or one belongs
    /// to another scheduler, plus every error of [`Conversation::prompt`].
    pub fn prompt_shared(&self, conversations: &[&Conversation], tokens: &[Token]) -> Result<()> {
        let mut owners = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            if !Arc::ptr_eq(conversation.shared(), &self.shared) {
                return Err(SchedulerError::DivergentHistory {
                    reason: format!(
                        "conversation {} belongs to another scheduler",
                        conversation.sequence_id()
                    ),
                });
            }
            conversation.ensure_usable()?;
            if owners.contains(&conversation.sequence_id()) {
                return Err(SchedulerError::DivergentHistory {
                    reason: format!("conversation {} was passed twice", conversation.sequence_id()),
                });
            }
            owners.push(conversation.sequence_id());
        }

        {
            let mut state = self.shared.state.lock();
            state.ensure_running()?;
            state.prompt(&owners, tokens)?;
        }
        if !tokens.is_empty() && !owners.is_empty() {
            self.shared.work_notifier.notify_one();
        }
        Ok(())
    }

    /// Evaluate everything queued so far in one evaluator call.
    ///
    /// The filling batch is swapped out before the evaluator is awaited; tokens queued
    /// meanwhile go to the next call. With nothing queued the evaluator is not called
    /// and the epoch still advances.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::Cancelled`] if `cancel` fires first. Queued tokens are kept.
    /// - [`SchedulerError::EvaluationFailed`] if the evaluator fails; the scheduler is
    ///   faulted and every later call fails with `SchedulerFaulted`.
    /// - [`SchedulerError::SchedulerDisposed`] / [`SchedulerError::SchedulerFaulted`].
    pub async fn infer(&self, cancel: &CancellationToken) -> Result<DecodeStatus> {
        let shared = &*self.shared;

        let _serial = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.cancelled(0)),
            serial = shared.infer_lock.lock() => serial,
        };

        let (checked_out, epoch) = {
            let mut state = shared.state.lock();
            state.ensure_running()?;
            let epoch = state.epoch();
            (state.buffers_mut().begin_evaluation(), epoch)
        };
        let Some(batch) = checked_out else {
            return Ok(self.advance_empty());
        };

        let in_flight = InFlight::new(shared, batch);
        let tokens = in_flight.batch().token_count();
        debug!(scheduler = %shared.id, %epoch, tokens, "evaluating batch");

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = shared.evaluator.evaluate(in_flight.batch()) => Some(status),
        };

        match status {
            None => {
                drop(in_flight);
                Err(self.cancelled(tokens))
            }
            Some(EvalStatus::NoCacheSlot) => {
                drop(in_flight);
                warn!(scheduler = %shared.id, %epoch, tokens, "no cache slot for batch, tokens kept");
                self.publish(epoch, tokens, InferStatus::NoCacheSlot);
                Ok(DecodeStatus::NoCacheSlot)
            }
            Some(EvalStatus::Error(code)) => {
                drop(in_flight);
                error!(scheduler = %shared.id, %epoch, tokens, code, "batch evaluation failed");
                self.fault(format!("evaluation failed with code {code}"));
                self.publish(epoch, tokens, InferStatus::Failed(code));
                Err(SchedulerError::EvaluationFailed { epoch, tokens, code })
            }
            Some(EvalStatus::Ok) => self.commit(in_flight.take(), epoch),
        }
    }

    /// Wait until the scheduler epoch reaches `target`.
    ///
    /// # Errors
    ///
    /// `SchedulerDisposed` or `SchedulerFaulted` if the scheduler stops first.
    pub async fn wait_for_epoch(&self, target: Epoch) -> Result<Epoch> {
        self.shared.wait_for_epoch(target).await
    }

    /// Stream of outcomes for every `infer` call made from now on.
    pub fn subscribe(&self) -> OutcomeStream {
        self.shared.subscribers.subscribe()
    }

    /// Drop every conversation and its cache rows. Later operations fail with
    /// `SchedulerDisposed`; a batch being evaluated is discarded when it returns.
    pub fn dispose(&self) -> Result<()> {
        let result = self.shared.state.lock().dispose();
        self.shared.halt();
        self.shared.work_notifier.notify_waiters();
        debug!(scheduler = %self.shared.id, "disposed scheduler");
        result
    }

    pub(crate) fn work_notifier(&self) -> Arc<Notify> {
        self.shared.work_notifier.clone()
    }

    fn commit(&self, batch: Batch, epoch: Epoch) -> Result<DecodeStatus> {
        let shared = &*self.shared;
        let tokens = batch.token_count();
        let logits: Vec<(usize, Arc<[f32]>)> = batch
            .logit_indices()
            .filter_map(|index| shared.evaluator.read_logits(index).map(|row| (index, Arc::from(row))))
            .collect();

        let committed = {
            let mut state = shared.state.lock();
            let outcome = state.ensure_running().and_then(|_| state.commit(&batch, logits));
            state.buffers_mut().complete_evaluation(batch);
            outcome.map(|_| state.advance_epoch())
        };

        match committed {
            Ok(next) => {
                shared.progress.send_modify(|progress| progress.epoch = next);
                debug!(scheduler = %shared.id, epoch = %next, tokens, "batch committed");
                self.publish(next, tokens, InferStatus::Evaluated);
                Ok(DecodeStatus::Ok)
            }
            Err(SchedulerError::SchedulerDisposed) => Err(SchedulerError::SchedulerDisposed),
            Err(e) => {
                error!(scheduler = %shared.id, %epoch, tokens, error = %e, "failed to commit batch");
                self.fault(format!("commit failed: {e}"));
                Err(e)
            }
        }
    }

    fn advance_empty(&self) -> DecodeStatus {
        let next = self.shared.state.lock().advance_epoch();
        self.shared.progress.send_modify(|progress| progress.epoch = next);
        self.publish(next, 0, InferStatus::Empty);
        DecodeStatus::Ok
    }

    fn cancelled(&self, tokens: usize) -> SchedulerError {
        let epoch = self.epoch();
        warn!(scheduler = %self.shared.id, %epoch, tokens, "inference cancelled, tokens kept");
        self.publish(epoch, tokens, InferStatus::Cancelled);
        SchedulerError::Cancelled { epoch }
    }

    fn fault(&self, reason: String) {
        self.shared.state.lock().fault(reason);
        self.shared.halt();
    }

    fn publish(&self, epoch: Epoch, tokens: usize, status: InferStatus) {
        self.shared.subscribers.publish(InferOutcome {
            epoch,
            tokens,
            status,
        });
    }
}
