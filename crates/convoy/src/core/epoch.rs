use std::fmt;

/// Version stamp advanced once per successful batch evaluation.
///
/// Epochs start at [`Epoch::INITIAL`] and only move forward. A conversation records
/// the epoch its tokens were queued under; its tokens have been evaluated once the
/// scheduler's epoch is strictly greater than that stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(u64);

impl Epoch {
    pub const INITIAL: Epoch = Epoch(1);

    pub fn get(self) -> u64 {
        self.0
    }

    /// The epoch after this one.
    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }

    /// The epoch before this one. Used to stamp work that was evaluated before the
    /// current scheduler existed.
    pub(crate) fn previous(self) -> Epoch {
        Epoch(self.0.saturating_sub(1))
    }

    /// Advance in place, returning the new value.
    pub(crate) fn advance(&mut self) -> Epoch {
        self.0 += 1;
        *self
    }

    /// Whether work stamped with `queued` has been evaluated as of this epoch.
    pub fn has_evaluated(self, queued: Epoch) -> bool {
        self > queued
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Epoch::INITIAL
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_starts_at_one_and_advances_by_one() {
        let mut epoch = Epoch::default();
        assert_eq!(epoch.get(), 1);
        assert_eq!(epoch.advance().get(), 2);
        assert_eq!(epoch.next().get(), 3);
        assert_eq!(epoch.get(), 2);
    }

    #[test]
    fn test_has_evaluated_is_strict() {
        let queued = Epoch::INITIAL;
        assert!(!queued.has_evaluated(queued));
        assert!(queued.next().has_evaluated(queued));
        assert!(queued.has_evaluated(queued.previous()));
    }
}
