//! State table: the current value of every key.
//!
//! The table is rebuilt incrementally from upstream updates. Its storage is
//! shared copy-on-write with the [`Snapshot`]s handed to `Full` breadcrumbs,
//! so taking a snapshot is O(1) and the copy is paid by the next mutation
//! (never by a reader).

use std::collections::btree_map::{self, BTreeMap};
use std::sync::Arc;

use bytes::Bytes;
use fanout_core::{FanoutResult, Key, Update};

/// Immutable view of the state table at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: Arc<BTreeMap<Key, Bytes>>,
}

impl Snapshot {
    /// Number of live keys.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no keys.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a key.
    #[inline]
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.entries.get(key)
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, Key, Bytes> {
        self.entries.iter()
    }

    /// The snapshot as a list of upserts, in key order.
    pub fn to_updates(&self) -> Vec<Update> {
        self.entries
            .iter()
            .map(|(k, v)| Update {
                key: k.clone(),
                value: Some(v.clone()),
            })
            .collect()
    }

    /// Return a new snapshot with `delta` applied on top of this one.
    pub fn apply(&self, delta: &[Update]) -> Snapshot {
        let mut entries = (*self.entries).clone();
        for update in delta {
            match &update.value {
                Some(value) => {
                    entries.insert(update.key.clone(), value.clone());
                }
                None => {
                    entries.remove(&update.key);
                }
            }
        }
        Snapshot {
            entries: Arc::new(entries),
        }
    }

    /// Whether two snapshots share the same storage.
    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }
}

impl FromIterator<(Key, Bytes)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (Key, Bytes)>>(iter: I) -> Self {
        Self {
            entries: Arc::new(iter.into_iter().collect()),
        }
    }
}

/// Before/after values of one key across a set of updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Value before the first update in the set.
    pub previous: Option<Bytes>,
    /// Value after the last update in the set.
    pub current: Option<Bytes>,
}

impl Change {
    /// Whether the key ends where it started.
    #[inline]
    pub fn is_noop(&self) -> bool {
        self.previous == self.current
    }
}

/// Net effect of one or more batches of updates, collapsed per key.
///
/// Only the first `previous` and the last `current` of each key are kept, so
/// `{a=1}` followed by `{a=2}` collapses to a single change ending in `a=2`.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    changes: BTreeMap<Key, Change>,
}

impl ChangeSet {
    /// Create an empty change set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one transition of `key`.
    pub fn record(&mut self, key: Key, previous: Option<Bytes>, current: Option<Bytes>) {
        match self.changes.entry(key) {
            btree_map::Entry::Occupied(mut entry) => entry.get_mut().current = current,
            btree_map::Entry::Vacant(entry) => {
                entry.insert(Change { previous, current });
            }
        }
    }

    /// Fold a later change set into this one.
    pub fn merge(&mut self, later: ChangeSet) {
        for (key, change) in later.changes {
            self.record(key, change.previous, change.current);
        }
    }

    /// Number of keys touched, including keys whose net effect is nil.
    #[inline]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether no key was touched.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Look up the change recorded for a key.
    pub fn get(&self, key: &str) -> Option<&Change> {
        self.changes.get(key)
    }

    /// Convert into the delta to publish: one update per key whose value
    /// actually changed, in key order.
    pub fn into_delta(self) -> Vec<Update> {
        self.changes
            .into_iter()
            .filter(|(_, change)| !change.is_noop())
            .map(|(key, change)| Update {
                key,
                value: change.current,
            })
            .collect()
    }
}

/// Mapping from key to current value, owned by the cache.
#[derive(Debug, Default)]
pub struct StateTable {
    entries: Arc<BTreeMap<Key, Bytes>>,
}

impl StateTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no keys.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a key.
    #[inline]
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.entries.get(key)
    }

    /// Apply a batch of updates and return its net effect.
    ///
    /// The batch is validated as a whole first; if any update is malformed
    /// the table is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::InvalidUpdate`](fanout_core::FanoutError::InvalidUpdate)
    /// for the first malformed update.
    pub fn apply(&mut self, updates: Vec<Update>) -> FanoutResult<ChangeSet> {
        for update in &updates {
            update.validate()?;
        }

        let mut changes = ChangeSet::new();
        if updates.is_empty() {
            return Ok(changes);
        }

        let entries = Arc::make_mut(&mut self.entries);
        for Update { key, value } in updates {
            let previous = match &value {
                Some(v) => entries.insert(key.clone(), v.clone()),
                None => entries.remove(&key),
            };
            if previous != value {
                changes.record(key, previous, value);
            }
        }
        Ok(changes)
    }

    /// Take an immutable snapshot of the current contents.
    ///
    /// The snapshot shares storage with the table until the next mutation.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            entries: Arc::clone(&self.entries),
        }
    }
}
