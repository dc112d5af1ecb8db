//! Change and failure callback dispatch.
//!
//! Handlers run synchronously on the sync loop's thread, in registration
//! order. A handler that returns an error or panics is logged and skipped;
//! the remaining handlers and the sync loop are unaffected.

use crate::error::SyncError;
use crate::snapshot::Snapshot;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Result returned by a change handler.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// One key's transition between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    /// Configuration key.
    pub key: String,
    /// Value before the update, `None` if the key was added.
    pub old: Option<String>,
    /// Value after the update, `None` if the key was removed.
    pub new: Option<String>,
}

/// An applied update, as seen by change handlers.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Snapshot now being served.
    pub current: Arc<Snapshot>,
    /// Snapshot it replaced.
    pub previous: Arc<Snapshot>,
    /// Keys whose value differs, sorted by key.
    pub changes: Vec<KeyChange>,
}

impl ChangeEvent {
    /// Builds an event, computing the per-key differences.
    pub fn new(current: Arc<Snapshot>, previous: Arc<Snapshot>) -> Self {
        let keys: BTreeSet<&String> = current
            .values()
            .keys()
            .chain(previous.values().keys())
            .collect();
        let changes = keys
            .into_iter()
            .filter_map(|key| {
                let old = previous.get(key);
                let new = current.get(key);
                (old != new).then(|| KeyChange {
                    key: key.clone(),
                    old: old.map(String::from),
                    new: new.map(String::from),
                })
            })
            .collect();

        Self {
            current,
            previous,
            changes,
        }
    }

    /// Returns the change for `key`, if it changed.
    pub fn change(&self, key: &str) -> Option<&KeyChange> {
        self.changes.iter().find(|c| c.key == key)
    }

    /// Returns true if `key` changed.
    pub fn is_changed(&self, key: &str) -> bool {
        self.change(key).is_some()
    }
}

/// Receives applied updates.
pub trait ChangeHandler: Send + Sync {
    /// Called once per applied update.
    fn on_change(&self, event: &ChangeEvent) -> HandlerResult;
}

impl<F> ChangeHandler for F
where
    F: Fn(&ChangeEvent) -> HandlerResult + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) -> HandlerResult {
        self(event)
    }
}

/// Receives failed sync attempts, for alerting.
pub trait FailureHandler: Send + Sync {
    /// Called once per failed sync attempt.
    fn on_sync_failure(&self, error: &SyncError);
}

impl<F> FailureHandler for F
where
    F: Fn(&SyncError) + Send + Sync,
{
    fn on_sync_failure(&self, error: &SyncError) {
        self(error)
    }
}

/// Outcome of one change dispatch.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Handlers that completed normally.
    pub succeeded: usize,
    /// Handlers that returned an error or panicked.
    pub failures: Vec<SyncError>,
}

impl DispatchReport {
    /// Returns true if every handler completed normally.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ordered registry of change handlers plus an optional failure handler.
#[derive(Default)]
pub struct CallbackDispatcher {
    handlers: RwLock<Vec<Arc<dyn ChangeHandler>>>,
    failure_handler: RwLock<Option<Arc<dyn FailureHandler>>>,
}

impl CallbackDispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a change handler.
    pub fn register(&self, handler: impl ChangeHandler + 'static) {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Appends an already shared change handler.
    pub fn register_shared(&self, handler: Arc<dyn ChangeHandler>) {
        self.handlers.write().push(handler);
    }

    /// Sets the failure handler, replacing any previous one.
    pub fn set_failure_handler(&self, handler: impl FailureHandler + 'static) {
        *self.failure_handler.write() = Some(Arc::new(handler));
    }

    /// Returns the number of registered change handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Invokes every change handler in registration order.
    pub fn dispatch_change(&self, event: &ChangeEvent) -> DispatchReport {
        // Snapshot the list so handlers may register more handlers.
        let handlers = self.handlers.read().clone();
        let mut report = DispatchReport::default();

        for (index, handler) in handlers.iter().enumerate() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.on_change(event)));
            let message = match outcome {
                Ok(Ok(())) => {
                    report.succeeded += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            error!(handler = index, error = %message, "change handler failed");
            report.failures.push(SyncError::Handler { index, message });
        }

        report
    }

    /// Invokes the failure handler, if any.
    pub fn dispatch_failure(&self, error: &SyncError) {
        let handler = self.failure_handler.read().clone();
        if let Some(handler) = handler {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| handler.on_sync_failure(error)));
            if let Err(payload) = outcome {
                error!(error = %panic_message(payload.as_ref()), "failure handler panicked");
            }
        }
    }
}

impl std::fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDispatcher")
            .field("handlers", &self.handler_count())
            .field("failure_handler", &self.failure_handler.read().is_some())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
