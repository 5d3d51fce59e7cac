//! # Sequence Identifiers
//!
//! Small value types shared by batches, the cache collaborator and conversations,
//! plus the allocator that hands out sequence ids.
//!
//! The KV cache addresses its rows by [`SequenceId`] and [`Position`]. A sequence id
//! is issued exactly once per scheduler and is never reused, even after the
//! conversation that owned it has been disposed, so that stale cache rows can never
//! be mistaken for rows of a newer conversation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// A token id as understood by the model vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub i32);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for Token {
    fn from(value: i32) -> Self {
        Token(value)
    }
}

/// Index of a token within its own sequence's timeline (not the batch row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Position(pub u32);

impl Position {
    /// The position directly after this one.
    pub fn next(self) -> Position {
        Position(self.0 + 1)
    }

    /// The position as a token count, i.e. the number of positions before it.
    pub fn as_count(self) -> usize {
        self.0 as usize
    }

    /// Convert a token count into the position that follows it.
    ///
    /// Returns `None` when the count does not fit the position width.
    pub fn from_count(count: usize) -> Option<Position> {
        u32::try_from(count).ok().map(Position)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Position {
    fn from(value: u32) -> Self {
        Position(value)
    }
}

/// Opaque identifier of one sequence (conversation) in the shared KV cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceId(u32);

impl SequenceId {
    /// The raw id, as passed to the native cache.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues strictly increasing sequence ids from a single counter.
///
/// The allocator is not synchronised; the scheduler only calls it from inside its
/// state critical section.
#[derive(Debug)]
pub struct SequenceAllocator {
    next: u32,
    limit: Option<u32>,
}

impl SequenceAllocator {
    /// Create an allocator. With a `limit`, ids `0..limit` are issued and the
    /// allocator is exhausted afterwards.
    pub fn new(limit: Option<u32>) -> Self {
        Self { next: 0, limit }
    }

    /// Issue the next id.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::SequenceSpaceExhausted`] once the configured limit or the
    /// integer width is reached. Exhaustion is permanent.
    pub fn next(&mut self) -> Result<SequenceId> {
        let id = self.next;
        let exhausted = match self.limit {
            Some(limit) => id >= limit,
            None => id == u32::MAX,
        };
        if exhausted {
            return Err(SchedulerError::SequenceSpaceExhausted {
                issued: u64::from(id),
            });
        }
        self.next = id + 1;
        Ok(SequenceId(id))
    }

    /// Number of ids issued so far.
    pub fn issued(&self) -> u64 {
        u64::from(self.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_is_strictly_increasing() {
        let mut allocator = SequenceAllocator::new(None);
        let ids: Vec<u32> = (0..5).map(|_| allocator.next().unwrap().get()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(allocator.issued(), 5);
    }

    #[test]
    fn test_allocator_exhausts_at_limit() {
        let mut allocator = SequenceAllocator::new(Some(2));
        allocator.next().unwrap();
        allocator.next().unwrap();

        let err = allocator.next().unwrap_err();
        assert!(matches!(err, SchedulerError::SequenceSpaceExhausted { issued: 2 }));

        // stays exhausted
        assert!(allocator.next().is_err());
        assert_eq!(allocator.issued(), 2);
    }

    #[test]
    fn test_allocator_exhausts_at_integer_width() {
        let mut allocator = SequenceAllocator { next: u32::MAX - 1, limit: None };
        assert_eq!(allocator.next().unwrap().get(), u32::MAX - 1);
        assert!(allocator.next().is_err());
    }

    #[test]
    fn test_position_count_conversions() {
        assert_eq!(Position::from_count(3), Some(Position(3)));
        assert_eq!(Position(3).next(), Position(4));
        assert_eq!(Position(7).as_count(), 7);
    }
}
