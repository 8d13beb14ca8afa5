use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Position of a snapshot in a store's commit history.
///
/// Produced by the store engine. The coordination layer only stores and
/// compares these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionId {
    generation: u64,
    index: u64,
}

/// Three-way result of comparing a handle's version against another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrdering {
    Behind,
    Same,
    Ahead,
}

impl VersionId {
    pub fn new(generation: u64, index: u64) -> Self {
        Self { generation, index }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Version produced by committing on top of `self`.
    pub fn next(&self) -> Self {
        Self {
            generation: self.generation,
            index: self.index.saturating_add(1),
        }
    }

    /// Where `self` stands relative to `other`.
    pub fn compare(&self, other: &VersionId) -> VersionOrdering {
        match self.cmp(other) {
            Ordering::Less => VersionOrdering::Behind,
            Ordering::Equal => VersionOrdering::Same,
            Ordering::Greater => VersionOrdering::Ahead,
        }
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.generation, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::{VersionId, VersionOrdering};

    #[test]
    fn compare_is_lexicographic_over_generation_then_index() {
        let a = VersionId::new(0, 9);
        let b = VersionId::new(1, 0);
        assert_eq!(a.compare(&b), VersionOrdering::Behind);
        assert_eq!(b.compare(&a), VersionOrdering::Ahead);
        assert_eq!(a.compare(&VersionId::new(0, 9)), VersionOrdering::Same);
    }

    #[test]
    fn next_is_always_ahead() {
        let v = VersionId::new(3, 41);
        assert_eq!(v.next().compare(&v), VersionOrdering::Ahead);
        assert_eq!(v.next().to_string(), "3:42");
    }
}
