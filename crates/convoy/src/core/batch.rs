//! # Batch Accumulator
//!
//! A [`Batch`] is the set of tokens submitted together to one evaluation call. It is
//! laid out column-wise (tokens, positions, logits flags and a flattened sequence id
//! table), mirroring the arrays a native evaluation routine consumes, so handing a
//! batch across the evaluation boundary never requires reshaping it.
//!
//! Clearing a batch truncates every column but keeps their allocations, so the same
//! storage is reused from one epoch to the next.

use std::ops::Range;

use crate::error::{Result, SchedulerError};
use crate::sequence::{Position, SequenceId, Token};

/// Borrowed view of one row of a [`Batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry<'a> {
    /// The token to evaluate
    pub token: Token,

    /// Position of the token within each owning sequence
    pub position: Position,

    /// Sequences this row belongs to; more than one only for sequences that share
    /// history up to `position`
    pub sequences: &'a [SequenceId],

    /// Whether the evaluator must produce logits for this row
    pub wants_logits: bool,
}

/// A bounded, ordered collection of pending batch entries.
#[derive(Debug, Clone)]
pub struct Batch {
    capacity: usize,
    tokens: Vec<Token>,
    positions: Vec<Position>,
    logits: Vec<bool>,
    /// `sequence_offsets[i]..sequence_offsets[i + 1]` indexes `sequence_ids` for row `i`
    sequence_offsets: Vec<usize>,
    sequence_ids: Vec<SequenceId>,
}

impl Batch {
    /// Create an empty batch holding at most `capacity` entries. Storage for the full
    /// capacity is reserved up front.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut sequence_offsets = Vec::with_capacity(capacity + 1);
        sequence_offsets.push(0);
        Self {
            capacity,
            tokens: Vec::with_capacity(capacity),
            positions: Vec::with_capacity(capacity),
            logits: Vec::with_capacity(capacity),
            sequence_offsets,
            sequence_ids: Vec::with_capacity(capacity),
        }
    }

    /// Append one entry, returning its row index.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::CapacityExceeded`] if the batch is already full. The batch is
    /// left untouched.
    pub fn append(
        &mut self,
        token: Token,
        position: Position,
        sequences: &[SequenceId],
        wants_logits: bool,
    ) -> Result<usize> {
        debug_assert!(!sequences.is_empty(), "a batch entry must belong to a sequence");
        self.ensure_room(1)?;

        let index = self.tokens.len();
        self.tokens.push(token);
        self.positions.push(position);
        self.logits.push(wants_logits);
        self.sequence_ids.extend_from_slice(sequences);
        self.sequence_offsets.push(self.sequence_ids.len());
        Ok(index)
    }

    /// Check that `requested` more entries fit without appending anything.
    pub fn ensure_room(&self, requested: usize) -> Result<()> {
        let available = self.remaining();
        if requested > available {
            return Err(SchedulerError::CapacityExceeded {
                requested,
                available,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Reset to zero entries, keeping the allocated storage.
    pub fn clear(&mut self) {
        self.tokens.clear();
        self.positions.clear();
        self.logits.clear();
        self.sequence_ids.clear();
        self.sequence_offsets.truncate(1);
    }

    /// Current fill level.
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tokens.len() == self.capacity
    }

    /// Token column.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Position column.
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// Logits flag column.
    pub fn logits(&self) -> &[bool] {
        &self.logits
    }

    /// Sequence ids owning row `index`.
    pub fn sequences(&self, index: usize) -> &[SequenceId] {
        &self.sequence_ids[self.sequence_range(index)]
    }

    /// Borrow row `index`, if present.
    pub fn entry(&self, index: usize) -> Option<BatchEntry<'_>> {
        if index >= self.tokens.len() {
            return None;
        }
        Some(BatchEntry {
            token: self.tokens[index],
            position: self.positions[index],
            sequences: self.sequences(index),
            wants_logits: self.logits[index],
        })
    }

    /// Iterate over all rows in order.
    pub fn entries(&self) -> impl ExactSizeIterator<Item = BatchEntry<'_>> + '_ {
        (0..self.tokens.len()).map(move |index| BatchEntry {
            token: self.tokens[index],
            position: self.positions[index],
            sequences: self.sequences(index),
            wants_logits: self.logits[index],
        })
    }

    /// Row indices marked as wanting logits.
    pub fn logit_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.logits
            .iter()
            .enumerate()
            .filter_map(|(index, wants)| wants.then_some(index))
    }

    fn sequence_range(&self, index: usize) -> Range<usize> {
        self.sequence_offsets[index]..self.sequence_offsets[index + 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SequenceAllocator;

    fn ids(n: usize) -> Vec<SequenceId> {
        let mut allocator = SequenceAllocator::new(None);
        (0..n).map(|_| allocator.next().unwrap()).collect()
    }

    #[test]
    fn test_append_returns_row_index() {
        let seq = ids(1);
        let mut batch = Batch::with_capacity(4);

        assert_eq!(batch.append(Token(7), Position(0), &seq, false).unwrap(), 0);
        assert_eq!(batch.append(Token(8), Position(1), &seq, true).unwrap(), 1);
        assert_eq!(batch.token_count(), 2);
        assert_eq!(batch.remaining(), 2);

        let entry = batch.entry(1).unwrap();
        assert_eq!(entry.token, Token(8));
        assert_eq!(entry.position, Position(1));
        assert_eq!(entry.sequences, &seq[..]);
        assert!(entry.wants_logits);
    }

    #[test]
    fn test_append_fails_when_full() {
        let seq = ids(1);
        let mut batch = Batch::with_capacity(2);
        batch.append(Token(1), Position(0), &seq, false).unwrap();
        batch.append(Token(2), Position(1), &seq, false).unwrap();
        assert!(batch.is_full());

        let err = batch.append(Token(3), Position(2), &seq, true).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::CapacityExceeded { requested: 1, available: 0, capacity: 2 }
        ));
        assert_eq!(batch.token_count(), 2);
    }

    #[test]
    fn test_entries_keep_multi_sequence_rows_separate() {
        let seqs = ids(3);
        let mut batch = Batch::with_capacity(8);
        batch.append(Token(1), Position(0), &seqs[..2], false).unwrap();
        batch.append(Token(2), Position(0), &seqs[2..], true).unwrap();
        batch.append(Token(3), Position(1), &seqs, true).unwrap();

        let rows: Vec<_> = batch.entries().map(|e| e.sequences.len()).collect();
        assert_eq!(rows, vec![2, 1, 3]);
        assert_eq!(batch.sequences(1), &seqs[2..]);
        assert_eq!(batch.logit_indices().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_clear_keeps_storage() {
        let seq = ids(1);
        let mut batch = Batch::with_capacity(16);
        for i in 0..16 {
            batch.append(Token(i), Position(i as u32), &seq, false).unwrap();
        }
        let reserved = batch.tokens.capacity();

        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.remaining(), 16);
        assert_eq!(batch.tokens.capacity(), reserved);
        assert!(batch.entry(0).is_none());

        batch.append(Token(42), Position(0), &seq, true).unwrap();
        assert_eq!(batch.sequences(0), &seq[..]);
    }

    #[test]
    fn test_ensure_room_reports_shortfall() {
        let seq = ids(1);
        let mut batch = Batch::with_capacity(3);
        batch.append(Token(1), Position(0), &seq, false).unwrap();

        assert!(batch.ensure_room(2).is_ok());
        let err = batch.ensure_room(3).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::CapacityExceeded { requested: 3, available: 2, capacity: 3 }
        ));
    }
}
