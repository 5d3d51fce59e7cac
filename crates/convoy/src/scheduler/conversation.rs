use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use super::Shared;
use super::snapshot::ConversationSnapshot;
use super::state::SchedulerState;
use crate::backend::Sampler;
use crate::core::Epoch;
use crate::error::{Result, SchedulerError};
use crate::sequence::{SequenceId, Token};

/// Observable state of a [`Conversation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    /// Nothing queued since creation, rewind or shift, or loaded from a snapshot
    /// without logits. Must be prompted before it can be sampled.
    Fresh,
    /// Tokens are queued and not yet evaluated.
    Prompting,
    /// Everything queued has been evaluated; logits can be read.
    Sampleable,
    Disposed,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConversationState::Fresh => "fresh",
            ConversationState::Prompting => "prompting",
            ConversationState::Sampleable => "sampleable",
            ConversationState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// # Conversation
///
/// A handle to one independently generated token sequence inside a
/// [`Scheduler`](super::Scheduler).
///
/// The handle only holds its sequence id; all of its bookkeeping lives in the
/// scheduler. Tokens queued through [`prompt`](Conversation::prompt) are evaluated by
/// the next [`infer`](super::Scheduler::infer) call that picks up their batch, after
/// which the conversation becomes sampleable.
///
/// Dropping a conversation disposes it, releasing its cache rows.
pub struct Conversation {
    sequence: SequenceId,
    shared: Arc<Shared>,
    disposed: bool,
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation")
            .field("sequence", &self.sequence)
            .field("state", &self.state())
            .finish()
    }
}

impl Conversation {
    pub(super) fn new(sequence: SequenceId, shared: Arc<Shared>) -> Self {
        Self {
            sequence,
            shared,
            disposed: false,
        }
    }

    pub(super) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SchedulerState) -> Result<T>) -> Result<T> {
        if self.disposed {
            return Err(SchedulerError::UseAfterDispose {
                sequence: self.sequence,
            });
        }
        let mut state = self.shared.state.lock();
        state.ensure_running()?;
        f(&mut state)
    }

    /// Fails with `UseAfterDispose` for a disposed handle and `SchedulerDisposed` or
    /// `SchedulerFaulted` when the scheduler is no longer running.
    pub(super) fn ensure_usable(&self) -> Result<()> {
        self.with_state(|state| state.sequence(self.sequence).map(|_| ()))
    }

    /// The sequence id backing this conversation in the shared cache.
    pub fn sequence_id(&self) -> SequenceId {
        self.sequence
    }

    pub fn state(&self) -> ConversationState {
        if self.disposed {
            return ConversationState::Disposed;
        }
        self.shared.state.lock().phase(self.sequence)
    }

    /// Tokens whose evaluated state is present in the cache.
    pub fn committed_tokens(&self) -> Result<usize> {
        self.with_state(|state| Ok(state.sequence(self.sequence)?.committed))
    }

    /// Tokens queued but not yet evaluated.
    pub fn pending_tokens(&self) -> Result<usize> {
        self.with_state(|state| Ok(state.sequence(self.sequence)?.pending))
    }

    /// Committed plus pending tokens, i.e. the position the next token will take.
    pub fn token_count(&self) -> Result<usize> {
        self.with_state(|state| {
            let record = state.sequence(self.sequence)?;
            Ok(record.committed + record.pending)
        })
    }

    /// Epoch stamp of the latest enqueue.
    pub fn queued_epoch(&self) -> Result<Option<Epoch>> {
        self.with_state(|state| Ok(state.sequence(self.sequence)?.queued))
    }

    /// Every token queued so far, committed ones first.
    pub fn history(&self) -> Result<Vec<Token>> {
        self.with_state(|state| Ok(state.sequence(self.sequence)?.history.clone()))
    }

    /// Whether queued tokens are still waiting for an `infer` call.
    pub fn requires_inference(&self) -> bool {
        self.state() == ConversationState::Prompting
    }

    pub fn is_sampleable(&self) -> bool {
        self.state() == ConversationState::Sampleable
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Queue `tokens` for evaluation.
    ///
    /// Tokens take consecutive positions after everything already queued; only the
    /// last one produces logits. Pending tokens may span several batches, so this is
    /// legal while the conversation is still prompting.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::CapacityExceeded`] if the filling batch cannot hold every
    ///   token. Nothing is queued; run `infer` and retry.
    /// - [`SchedulerError::ContextOverflow`] if the conversation would outgrow the
    ///   configured context length.
    pub fn prompt(&self, tokens: &[Token]) -> Result<()> {
        self.with_state(|state| state.prompt(&[self.sequence], tokens))?;
        if !tokens.is_empty() {
            self.shared.work_notifier.notify_one();
        }
        Ok(())
    }

    /// Queue a single token.
    pub fn prompt_token(&self, token: Token) -> Result<()> {
        self.prompt(&[token])
    }

    /// Logits captured for this conversation's last evaluated token.
    pub fn logits(&self) -> Result<Arc<[f32]>> {
        self.with_state(|state| state.logits(self.sequence).map(|(logits, _)| logits))
    }

    /// Run `sampler` over the current logits without queueing anything.
    pub fn select<S>(&self, sampler: &mut S) -> Result<Token>
    where
        S: Sampler + ?Sized,
    {
        let (logits, history) = self.with_state(|state| state.logits(self.sequence))?;
        Ok(sampler.select(&logits, &history))
    }

    /// Select the next token and queue it, returning the token.
    pub fn sample<S>(&self, sampler: &mut S) -> Result<Token>
    where
        S: Sampler + ?Sized,
    {
        // the sampler only runs once the token is known to fit
        let (logits, history) = self.with_state(|state| {
            let captured = state.logits(self.sequence)?;
            state.buffers().filling().ensure_room(1)?;
            Ok(captured)
        })?;
        let token = sampler.select(&logits, &history);
        self.prompt_token(token)?;
        Ok(token)
    }

    /// Branch into a new conversation sharing this one's committed state.
    ///
    /// The child gets a fresh sequence id, a copy of the committed cache rows, the
    /// token history and the captured logits, so a sampleable parent yields a
    /// sampleable child. The two evolve independently afterwards.
    pub fn fork(&self) -> Result<Conversation> {
        let child = self.with_state(|state| state.fork(self.sequence))?;
        debug!(parent = %self.sequence, sequence = %child, "forked conversation");
        Ok(Conversation::new(child, self.shared.clone()))
    }

    /// Keep only the first `count` committed tokens.
    ///
    /// Rewinding to the current committed count does nothing. Any other count drops the
    /// trailing cache rows and leaves the conversation [`Fresh`](ConversationState::Fresh).
    pub fn rewind(&self, count: usize) -> Result<()> {
        self.with_state(|state| state.rewind(self.sequence, count))?;
        debug!(sequence = %self.sequence, count, "rewound conversation");
        Ok(())
    }

    /// Remove `count` tokens following the first `keep` and move the later ones back,
    /// freeing room in a full context window. Needs a cache that supports shifting.
    ///
    /// A cache failure after rows were deleted faults the scheduler.
    pub fn shift_left(&self, count: usize, keep: usize) -> Result<()> {
        let result = self.with_state(|state| state.shift_left(self.sequence, count, keep));
        if let Err(SchedulerError::SchedulerFaulted { .. }) = &result {
            self.shared.halt();
        }
        result?;
        debug!(sequence = %self.sequence, count, keep, "shifted conversation");
        Ok(())
    }

    /// Capture this conversation's committed state in memory.
    pub fn save_state(&self) -> Result<ConversationSnapshot> {
        self.with_state(|state| state.snapshot(self.sequence))
    }

    /// Write this conversation's committed state to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let snapshot = self.save_state()?;
        snapshot.write_to(path)?;
        debug!(sequence = %self.sequence, path = %path.display(), tokens = snapshot.committed(), "saved conversation");
        Ok(())
    }

    /// Wait until everything queued so far has been evaluated.
    ///
    /// Returns immediately for a conversation that has nothing queued.
    pub async fn ready(&self) -> Result<Epoch> {
        match self.queued_epoch()? {
            Some(queued) => self.shared.wait_for_epoch(queued.next()).await,
            None => Ok(self.shared.state.lock().epoch()),
        }
    }

    /// Release this conversation's cache rows. Idempotent.
    ///
    /// Tokens it still has queued are evaluated with their batch and dropped right
    /// after.
    pub fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        self.shared.state.lock().release(self.sequence)?;
        debug!(sequence = %self.sequence, "disposed conversation");
        Ok(())
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!(sequence = %self.sequence, error = %e, "failed to release conversation on drop");
        }
    }
}
