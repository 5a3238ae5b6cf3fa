//! Keys and updates.
//!
//! A [`Key`] identifies one entry in the upstream store. An [`Update`] is a
//! key together with either a new value or a tombstone.

use std::borrow::Borrow;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::FanoutError;

/// Opaque, totally ordered key of an upstream entry.
///
/// # Example
///
/// ```rust
/// use fanout_core::Key;
///
/// let a = Key::new("/a");
/// let b: Key = "/b".into();
/// assert!(a < b);
/// assert_eq!(a.as_str(), "/a");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    /// Longest key accepted by [`Update::validate`], in bytes.
    pub const MAX_LEN: usize = 4096;

    /// Create a key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length of the key in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key is empty. Empty keys are never valid in an update.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume and return the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A single change to the key space: an upsert or a tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    /// Key being changed.
    pub key: Key,
    /// New value, or `None` for a deletion.
    pub value: Option<Bytes>,
}

impl Update {
    /// Create an upsert.
    pub fn upsert(key: impl Into<Key>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Create a deletion.
    pub fn delete(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    /// Whether this update deletes its key.
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Approximate in-memory size of this update, in bytes.
    #[inline]
    pub fn size_hint(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, Bytes::len)
    }

    /// Check that this update is well formed.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::InvalidUpdate`] if the key is empty or longer
    /// than [`Key::MAX_LEN`].
    pub fn validate(&self) -> Result<(), FanoutError> {
        if self.key.is_empty() {
            return Err(FanoutError::invalid_update("", "key cannot be empty"));
        }
        if self.key.len() > Key::MAX_LEN {
            return Err(FanoutError::invalid_update(
                truncated(self.key.as_str()),
                format!("key length {} exceeds {}", self.key.len(), Key::MAX_LEN),
            ));
        }
        Ok(())
    }
}

fn truncated(key: &str) -> String {
    let mut end = key.len().min(64);
    while !key.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &key[..end])
}
