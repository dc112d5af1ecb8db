//! Per-app configuration storage with revisions and change notification.

use confsync_protocol::Revision;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// What changed for an app since a given revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeSet {
    /// Nothing newer than the given revision.
    Unchanged(Revision),
    /// Keys set or removed since the given revision.
    Diff {
        /// Current revision.
        revision: Revision,
        /// Keys set, with their new values.
        values: HashMap<String, String>,
        /// Keys removed.
        removed: Vec<String>,
    },
    /// The whole mapping, when history does not reach back far enough.
    Full {
        /// Current revision.
        revision: Revision,
        /// Complete mapping.
        values: HashMap<String, String>,
    },
}

impl ChangeSet {
    /// Returns the revision the change set brings a client to.
    pub fn revision(&self) -> Revision {
        match self {
            ChangeSet::Unchanged(revision)
            | ChangeSet::Diff { revision, .. }
            | ChangeSet::Full { revision, .. } => *revision,
        }
    }
}

struct ChangeRecord {
    revision: Revision,
    key: String,
    value: Option<String>,
}

#[derive(Default)]
struct AppState {
    values: HashMap<String, String>,
    revision: Revision,
    history: VecDeque<ChangeRecord>,
    /// Oldest revision a diff can be computed from.
    history_floor: Revision,
}

impl AppState {
    fn record(&mut self, revision: Revision, key: String, value: Option<String>, limit: usize) {
        self.history.push_back(ChangeRecord {
            revision,
            key,
            value,
        });
        while self.history.len() > limit {
            if let Some(dropped) = self.history.pop_front() {
                self.history_floor = dropped.revision;
            }
        }
    }

    fn changes_since(&self, since: Revision) -> ChangeSet {
        if self.revision == since {
            return ChangeSet::Unchanged(self.revision);
        }
        if since > self.revision || since < self.history_floor {
            return ChangeSet::Full {
                revision: self.revision,
                values: self.values.clone(),
            };
        }

        let mut latest: BTreeMap<&str, Option<&str>> = BTreeMap::new();
        for record in self.history.iter().filter(|r| r.revision > since) {
            latest.insert(&record.key, record.value.as_deref());
        }
        let mut values = HashMap::new();
        let mut removed = Vec::new();
        for (key, value) in latest {
            match value {
                Some(value) => {
                    values.insert(key.to_string(), value.to_string());
                }
                None => removed.push(key.to_string()),
            }
        }
        ChangeSet::Diff {
            revision: self.revision,
            values,
            removed,
        }
    }
}

/// In-memory configuration store.
///
/// Every mutation bumps the app's revision by one and wakes long-poll
/// waiters. Unknown apps read as empty at [`Revision::ZERO`].
pub struct ConfigRepository {
    apps: Mutex<HashMap<String, AppState>>,
    changed: Condvar,
    closed: Mutex<bool>,
    history_limit: usize,
}

impl ConfigRepository {
    /// Creates an empty repository keeping `history_limit` change records
    /// per app.
    pub fn new(history_limit: usize) -> Self {
        Self {
            apps: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
            closed: Mutex::new(false),
            history_limit: history_limit.max(1),
        }
    }

    /// Sets `key` for `app` and returns the new revision.
    ///
    /// Setting a key to its current value is a no-op.
    pub fn publish(&self, app: &str, key: &str, value: &str) -> Revision {
        let mut apps = self.apps.lock();
        let state = apps.entry(app.to_string()).or_default();
        if state.values.get(key).map(String::as_str) == Some(value) {
            return state.revision;
        }
        state.revision = state.revision.next();
        state.values.insert(key.to_string(), value.to_string());
        let revision = state.revision;
        state.record(revision, key.to_string(), Some(value.to_string()), self.history_limit);
        drop(apps);

        debug!(app, key, revision = %revision, "published");
        self.changed.notify_all();
        revision
    }

    /// Removes `key` from `app`. Returns the new revision, or `None` if the
    /// key was not present.
    pub fn remove(&self, app: &str, key: &str) -> Option<Revision> {
        let mut apps = self.apps.lock();
        let state = apps.get_mut(app)?;
        state.values.remove(key)?;
        state.revision = state.revision.next();
        let revision = state.revision;
        state.record(revision, key.to_string(), None, self.history_limit);
        drop(apps);

        debug!(app, key, revision = %revision, "removed");
        self.changed.notify_all();
        Some(revision)
    }

    /// Replaces the whole mapping for `app` under a single new revision.
    pub fn publish_all(&self, app: &str, values: HashMap<String, String>) -> Revision {
        let mut apps = self.apps.lock();
        let state = apps.entry(app.to_string()).or_default();
        let revision = state.revision.next();

        let mut removed: Vec<String> = state
            .values
            .keys()
            .filter(|key| !values.contains_key(*key))
            .cloned()
            .collect();
        removed.sort();
        let mut changed: Vec<(String, String)> = values
            .iter()
            .filter(|(key, value)| state.values.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        changed.sort();

        for key in removed {
            state.record(revision, key, None, self.history_limit);
        }
        for (key, value) in changed {
            state.record(revision, key, Some(value), self.history_limit);
        }
        state.values = values;
        state.revision = revision;
        drop(apps);

        debug!(app, revision = %revision, "published full mapping");
        self.changed.notify_all();
        revision
    }

    /// Returns the current revision of `app`.
    pub fn revision(&self, app: &str) -> Revision {
        self.apps
            .lock()
            .get(app)
            .map(|s| s.revision)
            .unwrap_or(Revision::ZERO)
    }

    /// Returns the current revision and mapping of `app`.
    pub fn snapshot(&self, app: &str) -> (Revision, HashMap<String, String>) {
        self.apps
            .lock()
            .get(app)
            .map(|s| (s.revision, s.values.clone()))
            .unwrap_or_default()
    }

    /// Returns what changed for `app` since `since`, without waiting.
    pub fn changes_since(&self, app: &str, since: Revision) -> ChangeSet {
        let apps = self.apps.lock();
        match apps.get(app) {
            Some(state) => state.changes_since(since),
            None => AppState::default().changes_since(since),
        }
    }

    /// Waits until `app` moves past `since`, the repository is closed, or
    /// `timeout` elapses, then returns what changed.
    pub fn wait_for_change(&self, app: &str, since: Revision, timeout: Duration) -> ChangeSet {
        let deadline = Instant::now() + timeout;
        let mut apps = self.apps.lock();
        loop {
            let current = apps.get(app).map(|s| s.revision).unwrap_or(Revision::ZERO);
            if current != since || self.is_closed() {
                break;
            }
            if self.changed.wait_until(&mut apps, deadline).timed_out() {
                break;
            }
        }
        match apps.get(app) {
            Some(state) => state.changes_since(since),
            None => AppState::default().changes_since(since),
        }
    }

    /// Wakes every waiter and makes future waits return immediately.
    pub fn close(&self) {
        *self.closed.lock() = true;
        // Take the apps lock so no waiter misses the wakeup
        let _apps = self.apps.lock();
        self.changed.notify_all();
    }

    /// Returns true once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl Default for ConfigRepository {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_HISTORY_LIMIT)
    }
}

impl std::fmt::Debug for ConfigRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigRepository")
            .field("apps", &self.apps.lock().len())
            .field("history_limit", &self.history_limit)
            .finish()
    }
}
