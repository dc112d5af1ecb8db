//! Snapshot store with atomic replace.

use confsync_protocol::Revision;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Complete key/value configuration plus its revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    values: HashMap<String, String>,
    revision: Revision,
}

impl Snapshot {
    /// Creates a snapshot.
    pub fn new(values: HashMap<String, String>, revision: Revision) -> Self {
        Self { values, revision }
    }

    /// Returns the value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns the full mapping.
    pub fn values(&self) -> &HashMap<String, String> {
        &self.values
    }

    /// Returns the revision.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Returns the number of keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no keys.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Holds the active snapshot.
///
/// Readers clone an `Arc` under a single read lock and never see a
/// half-applied update: a replacement is fully built before it is published.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotStore {
    /// Creates an empty store at [`Revision::ZERO`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the active snapshot.
    pub fn read(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read())
    }

    /// Publishes a new snapshot and returns the one it replaced.
    pub fn replace(&self, values: HashMap<String, String>, revision: Revision) -> Arc<Snapshot> {
        self.publish(Arc::new(Snapshot::new(values, revision)))
    }

    /// Publishes an already built snapshot and returns the one it replaced.
    pub fn publish(&self, snapshot: Arc<Snapshot>) -> Arc<Snapshot> {
        std::mem::replace(&mut *self.current.write(), snapshot)
    }

    /// Returns the revision of the active snapshot.
    pub fn current_revision(&self) -> Revision {
        self.current.read().revision
    }

    /// Returns a copy of the value for `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.current.read().get(key).map(String::from)
    }
}
