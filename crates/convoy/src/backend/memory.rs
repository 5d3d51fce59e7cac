//! In-memory KV cache bookkeeping.
//!
//! [`MemoryKvCache`] tracks which positions of which sequences hold evaluated state,
//! and which sequence originally evaluated each row (so a forked row can be told apart
//! from a freshly evaluated one). It holds no attention tensors. It is the default
//! cache for evaluators that keep their tensors elsewhere, and the cache used by the
//! crate's tests.
//!
//! Handles are cheap to clone and share the same rows, so a caller can keep a handle
//! to inspect the cache after moving one into a scheduler.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use bytes::{Buf, BufMut};
use parking_lot::Mutex;

use super::KvCache;
use crate::error::CacheError;
use crate::sequence::{Position, SequenceId};

type Rows = BTreeMap<Position, SequenceId>;

const ROW_BYTES: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct MemoryKvCache {
    sequences: Arc<Mutex<BTreeMap<SequenceId, Rows>>>,
}

impl MemoryKvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions currently held for `sequence`, ascending.
    pub fn positions(&self, sequence: SequenceId) -> Vec<Position> {
        self.sequences
            .lock()
            .get(&sequence)
            .map(|rows| rows.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, sequence: SequenceId) -> usize {
        self.sequences.lock().get(&sequence).map_or(0, |rows| rows.len())
    }

    pub fn total_rows(&self) -> usize {
        self.sequences.lock().values().map(|rows| rows.len()).sum()
    }

    /// The sequence whose evaluation produced the row at `position` of `sequence`.
    pub fn origin(&self, sequence: SequenceId, position: Position) -> Option<SequenceId> {
        self.sequences.lock().get(&sequence)?.get(&position).copied()
    }

    /// Sequences holding at least one row.
    pub fn sequences(&self) -> Vec<SequenceId> {
        self.sequences
            .lock()
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(sequence, _)| *sequence)
            .collect()
    }
}

impl KvCache for MemoryKvCache {
    fn extend(&mut self, sequence: SequenceId, range: Range<Position>) -> Result<(), CacheError> {
        let mut sequences = self.sequences.lock();
        let rows = sequences.entry(sequence).or_default();
        if let Some(position) = (range.start.0..range.end.0).map(Position).find(|p| rows.contains_key(p)) {
            return Err(CacheError::RowOccupied { sequence, position });
        }
        for position in range.start.0..range.end.0 {
            rows.insert(Position(position), sequence);
        }
        Ok(())
    }

    fn duplicate_rows(
        &mut self,
        source: SequenceId,
        destination: SequenceId,
        up_to: Position,
    ) -> Result<(), CacheError> {
        let mut sequences = self.sequences.lock();
        let copied: Rows = sequences
            .get(&source)
            .map(|rows| rows.range(..up_to).map(|(p, o)| (*p, *o)).collect())
            .unwrap_or_default();
        if let Some(missing) = (0..up_to.0).map(Position).find(|p| !copied.contains_key(p)) {
            return Err(CacheError::MissingRow {
                sequence: source,
                position: missing,
            });
        }
        sequences.entry(destination).or_default().extend(copied);
        Ok(())
    }

    fn delete_rows(&mut self, sequence: SequenceId, from: Position, to: Position) -> Result<(), CacheError> {
        let mut sequences = self.sequences.lock();
        if let Some(rows) = sequences.get_mut(&sequence) {
            rows.retain(|position, _| *position < from || *position >= to);
            if rows.is_empty() {
                sequences.remove(&sequence);
            }
        }
        Ok(())
    }

    fn read_raw(&self, sequence: SequenceId, range: Range<Position>) -> Result<Vec<u8>, CacheError> {
        let sequences = self.sequences.lock();
        let empty = Rows::new();
        let rows = sequences.get(&sequence).unwrap_or(&empty);

        let mut buf = Vec::with_capacity(4 + ROW_BYTES * range.end.as_count().saturating_sub(range.start.as_count()));
        let selected: Vec<_> = rows.range(range.clone()).collect();
        buf.put_u32(selected.len() as u32);
        for (position, origin) in selected {
            buf.put_u32(position.0);
            buf.put_u32(origin.get());
        }
        Ok(buf)
    }

    fn write_raw(&mut self, sequence: SequenceId, bytes: &[u8]) -> Result<usize, CacheError> {
        let malformed = |reason: &str| CacheError::MalformedBlob {
            sequence,
            reason: reason.to_string(),
        };

        let mut buf = bytes;
        if buf.remaining() < 4 {
            return Err(malformed("missing row count"));
        }
        let count = buf.get_u32() as usize;
        if buf.remaining() != count * ROW_BYTES {
            return Err(malformed("row count does not match blob length"));
        }

        let mut restored = Rows::new();
        for _ in 0..count {
            let position = Position(buf.get_u32());
            // rows keep their original lineage only within one cache; restored rows
            // belong to the sequence they were loaded into
            let _origin = buf.get_u32();
            restored.insert(position, sequence);
        }

        let mut sequences = self.sequences.lock();
        let rows = sequences.entry(sequence).or_default();
        if let Some(position) = restored.keys().find(|p| rows.contains_key(p)) {
            return Err(CacheError::RowOccupied {
                sequence,
                position: *position,
            });
        }
        let count = restored.len();
        rows.extend(restored);
        Ok(count)
    }

    fn can_shift(&self) -> bool {
        true
    }

    fn shift_rows(
        &mut self,
        sequence: SequenceId,
        from: Position,
        to: Position,
        by: u32,
    ) -> Result<(), CacheError> {
        if by > from.0 {
            return Err(CacheError::Unsupported("shift_rows below position 0"));
        }
        let mut sequences = self.sequences.lock();
        let Some(rows) = sequences.get_mut(&sequence) else {
            return Ok(());
        };

        let moved: Vec<_> = rows.range(from..to).map(|(p, o)| (*p, *o)).collect();
        if let Some((position, _)) = moved
            .iter()
            .map(|(p, o)| (Position(p.0 - by), *o))
            .find(|(target, _)| (*target < from) && rows.contains_key(target))
        {
            return Err(CacheError::RowOccupied { sequence, position });
        }
        for (position, _) in &moved {
            rows.remove(position);
        }
        for (position, origin) in moved {
            rows.insert(Position(position.0 - by), origin);
        }
        Ok(())
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

    fn range(from: u32, to: u32) -> Range<Position> {
        Position(from)..Position(to)
    }

    #[test]
    fn test_extend_records_rows() {
        let s = ids(1)[0];
        let mut cache = MemoryKvCache::new();
        cache.extend(s, range(0, 3)).unwrap();
        assert_eq!(cache.positions(s), vec![Position(0), Position(1), Position(2)]);

        let err = cache.extend(s, range(2, 4)).unwrap_err();
        assert_eq!(err, CacheError::RowOccupied { sequence: s, position: Position(2) });
        assert_eq!(cache.row_count(s), 3);
    }

    #[test]
    fn test_duplicate_keeps_origin() {
        let s = ids(2);
        let mut cache = MemoryKvCache::new();
        cache.extend(s[0], range(0, 4)).unwrap();
        cache.duplicate_rows(s[0], s[1], Position(3)).unwrap();

        assert_eq!(cache.row_count(s[1]), 3);
        assert_eq!(cache.origin(s[1], Position(2)), Some(s[0]));
        assert_eq!(cache.total_rows(), 7);
    }

    #[test]
    fn test_duplicate_requires_contiguous_source() {
        let s = ids(2);
        let mut cache = MemoryKvCache::new();
        cache.extend(s[0], range(0, 2)).unwrap();
        let err = cache.duplicate_rows(s[0], s[1], Position(3)).unwrap_err();
        assert_eq!(err, CacheError::MissingRow { sequence: s[0], position: Position(2) });
        assert_eq!(cache.row_count(s[1]), 0);
    }

    #[test]
    fn test_delete_ignores_absent_rows() {
        let s = ids(2);
        let mut cache = MemoryKvCache::new();
        cache.extend(s[0], range(0, 5)).unwrap();
        cache.delete_rows(s[0], Position(3), Position(10)).unwrap();
        cache.delete_rows(s[1], Position(0), Position(10)).unwrap();
        assert_eq!(cache.row_count(s[0]), 3);

        cache.delete_rows(s[0], Position(0), Position(3)).unwrap();
        assert!(cache.sequences().is_empty());
    }

    #[test]
    fn test_raw_blob_restores_into_other_sequence() {
        let s = ids(2);
        let mut cache = MemoryKvCache::new();
        cache.extend(s[0], range(0, 4)).unwrap();
        let blob = cache.read_raw(s[0], range(0, 4)).unwrap();
        assert_eq!(blob.len(), 4 + 4 * ROW_BYTES);

        let mut other = MemoryKvCache::new();
        assert_eq!(other.write_raw(s[1], &blob).unwrap(), 4);
        assert_eq!(other.row_count(s[1]), 4);
        assert_eq!(other.origin(s[1], Position(0)), Some(s[1]));
    }

    #[test]
    fn test_write_raw_rejects_truncated_blob() {
        let s = ids(1)[0];
        let mut cache = MemoryKvCache::new();
        let err = cache.write_raw(s, &[0, 0, 0, 2, 0, 0]).unwrap_err();
        assert!(matches!(err, CacheError::MalformedBlob { .. }));
        assert_eq!(cache.row_count(s), 0);
    }

    #[test]
    fn test_shift_moves_tail_back() {
        let s = ids(1)[0];
        let mut cache = MemoryKvCache::new();
        cache.extend(s, range(0, 8)).unwrap();
        cache.delete_rows(s, Position(2), Position(5)).unwrap();
        cache.shift_rows(s, Position(5), Position(8), 3).unwrap();
        assert_eq!(
            cache.positions(s),
            vec![Position(0), Position(1), Position(2), Position(3), Position(4)]
        );
    }

    #[test]
    fn test_clones_share_rows() {
        let s = ids(1)[0];
        let mut cache = MemoryKvCache::new();
        let observer = cache.clone();
        cache.extend(s, range(0, 2)).unwrap();
        assert_eq!(observer.row_count(s), 2);
    }
}
