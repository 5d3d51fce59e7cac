//! Double-buffered batch storage.
//!
//! Exactly two [`Batch`] instances exist for the lifetime of a scheduler. One is
//! *filling*: every append targets it. The other is *idle*: empty and waiting, checked
//! out to the evaluator, or parked because its evaluation failed while new entries
//! were already arriving in the filling buffer.
//!
//! Role changes only happen through [`DoubleBuffer::begin_evaluation`],
//! [`DoubleBuffer::abort_evaluation`] and [`DoubleBuffer::complete_evaluation`].

use std::mem;

use super::batch::Batch;

#[derive(Debug)]
pub(crate) enum IdleSlot {
    /// Empty, becomes the filling buffer on the next swap.
    Ready(Batch),
    /// Checked out to the evaluator.
    Evaluating,
    /// An unevaluated batch that must run before the filling buffer.
    Retry(Batch),
}

#[derive(Debug)]
pub(crate) struct DoubleBuffer {
    filling: Batch,
    idle: IdleSlot,
}

impl DoubleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            filling: Batch::with_capacity(capacity),
            idle: IdleSlot::Ready(Batch::with_capacity(capacity)),
        }
    }

    pub fn filling(&self) -> &Batch {
        &self.filling
    }

    pub fn filling_mut(&mut self) -> &mut Batch {
        &mut self.filling
    }

    #[cfg(test)]
    pub fn idle(&self) -> &IdleSlot {
        &self.idle
    }

    /// Whether a batch is queued or running ahead of the filling buffer, i.e. the
    /// filling buffer needs one more successful evaluation than usual before it runs.
    pub fn has_batch_ahead(&self) -> bool {
        !matches!(self.idle, IdleSlot::Ready(_))
    }

    pub fn is_evaluating(&self) -> bool {
        matches!(self.idle, IdleSlot::Evaluating)
    }

    /// Tokens waiting for evaluation, excluding a batch currently checked out.
    pub fn pending_tokens(&self) -> usize {
        let parked = match &self.idle {
            IdleSlot::Retry(batch) => batch.token_count(),
            _ => 0,
        };
        self.filling.token_count() + parked
    }

    /// Check out the next batch to evaluate.
    ///
    /// A parked retry batch goes first and the filling buffer keeps its role.
    /// Otherwise the roles are swapped: the idle buffer starts filling and the filled
    /// one is returned. Returns `None` when there is nothing to evaluate or a batch is
    /// already checked out.
    pub fn begin_evaluation(&mut self) -> Option<Batch> {
        match mem::replace(&mut self.idle, IdleSlot::Evaluating) {
            IdleSlot::Retry(batch) => Some(batch),
            IdleSlot::Ready(empty) => {
                if self.filling.is_empty() {
                    self.idle = IdleSlot::Ready(empty);
                    return None;
                }
                Some(mem::replace(&mut self.filling, empty))
            }
            IdleSlot::Evaluating => None,
        }
    }

    /// Return an unevaluated batch after a failed or cancelled evaluation.
    ///
    /// If nothing was appended meanwhile the swap is undone and `batch` is the filling
    /// buffer again. Otherwise `batch` is parked so it still runs before the entries
    /// that arrived after it.
    pub fn abort_evaluation(&mut self, batch: Batch) {
        debug_assert!(self.is_evaluating());
        if self.filling.is_empty() {
            let empty = mem::replace(&mut self.filling, batch);
            self.idle = IdleSlot::Ready(empty);
        } else {
            self.idle = IdleSlot::Retry(batch);
        }
    }

    /// Return an evaluated batch; it is cleared and becomes the idle buffer.
    pub fn complete_evaluation(&mut self, mut batch: Batch) {
        debug_assert!(self.is_evaluating());
        batch.clear();
        self.idle = IdleSlot::Ready(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{Position, SequenceAllocator, SequenceId, Token};

    fn seq() -> SequenceId {
        SequenceAllocator::new(None).next().unwrap()
    }

    fn fill(batch: &mut Batch, tokens: &[i32]) {
        let s = [seq()];
        for (i, t) in tokens.iter().enumerate() {
            batch.append(Token(*t), Position(i as u32), &s, false).unwrap();
        }
    }

    #[test]
    fn test_empty_filling_is_not_checked_out() {
        let mut buffers = DoubleBuffer::new(4);
        assert!(buffers.begin_evaluation().is_none());
        assert!(!buffers.has_batch_ahead());
    }

    #[test]
    fn test_swap_routes_appends_to_other_buffer() {
        let mut buffers = DoubleBuffer::new(4);
        fill(buffers.filling_mut(), &[1, 2]);

        let batch = buffers.begin_evaluation().unwrap();
        assert_eq!(batch.tokens(), &[Token(1), Token(2)]);
        assert!(buffers.filling().is_empty());
        assert!(buffers.is_evaluating());
        assert!(buffers.has_batch_ahead());

        fill(buffers.filling_mut(), &[3]);
        buffers.complete_evaluation(batch);
        assert_eq!(buffers.filling().tokens(), &[Token(3)]);
        assert!(matches!(buffers.idle(), IdleSlot::Ready(b) if b.is_empty()));
    }

    #[test]
    fn test_abort_without_new_entries_undoes_swap() {
        let mut buffers = DoubleBuffer::new(4);
        fill(buffers.filling_mut(), &[1, 2, 3]);

        let batch = buffers.begin_evaluation().unwrap();
        buffers.abort_evaluation(batch);

        assert_eq!(buffers.filling().tokens(), &[Token(1), Token(2), Token(3)]);
        assert!(!buffers.has_batch_ahead());
        assert_eq!(buffers.pending_tokens(), 3);
    }

    #[test]
    fn test_abort_with_new_entries_parks_batch_ahead() {
        let mut buffers = DoubleBuffer::new(4);
        fill(buffers.filling_mut(), &[1, 2]);

        let batch = buffers.begin_evaluation().unwrap();
        fill(buffers.filling_mut(), &[9]);
        buffers.abort_evaluation(batch);

        assert!(buffers.has_batch_ahead());
        assert_eq!(buffers.pending_tokens(), 3);

        // the parked batch runs first, filling keeps collecting
        let retry = buffers.begin_evaluation().unwrap();
        assert_eq!(retry.tokens(), &[Token(1), Token(2)]);
        assert_eq!(buffers.filling().tokens(), &[Token(9)]);
        buffers.complete_evaluation(retry);

        let next = buffers.begin_evaluation().unwrap();
        assert_eq!(next.tokens(), &[Token(9)]);
    }

    #[test]
    fn test_no_second_checkout_while_evaluating() {
        let mut buffers = DoubleBuffer::new(4);
        fill(buffers.filling_mut(), &[1]);
        let _batch = buffers.begin_evaluation().unwrap();
        fill(buffers.filling_mut(), &[2]);
        assert!(buffers.begin_evaluation().is_none());
        assert!(buffers.is_evaluating());
    }
}
