//! Breadcrumb sequence numbers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a breadcrumb in the chain.
///
/// Sequences start at [`Sequence::FIRST`] for the first breadcrumb published
/// after startup and increase by exactly one per breadcrumb.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(u64);

impl Sequence {
    /// Sequence of the first published breadcrumb.
    pub const FIRST: Sequence = Sequence(1);

    /// Create a sequence from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw value.
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// The sequence that follows this one.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// How many breadcrumbs `self` is behind `tail`. Zero if caught up.
    #[must_use]
    pub const fn lag_behind(&self, tail: Sequence) -> u64 {
        tail.0.saturating_sub(self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Sequence> for u64 {
    fn from(seq: Sequence) -> Self {
        seq.0
    }
}
