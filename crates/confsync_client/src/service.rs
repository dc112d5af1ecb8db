//! Read access to configuration values.

use crate::config::ConnectionContext;
use crate::error::{SyncError, SyncResult};
use crate::node::NodeChooser;
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::transport::{accepted_fetch, ConfigTransport};
use confsync_protocol::FetchRequest;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// Key/value lookup.
pub trait ConfigService: Send + Sync {
    /// Returns the value for `key`, or [`SyncError::NotFound`].
    fn get(&self, key: &str) -> SyncResult<String>;

    /// Returns the value for `key`, or `default` when it is absent.
    ///
    /// Other errors are still returned.
    fn get_or(&self, key: &str, default: &str) -> SyncResult<String> {
        match self.get(key) {
            Err(SyncError::NotFound(_)) => Ok(default.to_string()),
            other => other,
        }
    }

    /// Returns true if `key` is present.
    fn contains(&self, key: &str) -> SyncResult<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(SyncError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Returns the value for `key` parsed as `V`.
    fn get_parsed<V>(&self, key: &str) -> SyncResult<V>
    where
        V: FromStr,
        V::Err: std::fmt::Display,
        Self: Sized,
    {
        let raw = self.get(key)?;
        raw.trim().parse().map_err(|e: V::Err| SyncError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
    }
}

/// Serves values from the local snapshot. Never touches the network.
#[derive(Debug, Clone)]
pub struct CachedConfigService {
    store: Arc<SnapshotStore>,
}

impl CachedConfigService {
    /// Creates a service over `store`.
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        Self { store }
    }

    /// Returns the active snapshot, for consistent multi-key reads.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.store.read()
    }

    /// Returns a copy of the whole mapping.
    pub fn all(&self) -> HashMap<String, String> {
        self.store.read().values().clone()
    }
}

impl ConfigService for CachedConfigService {
    fn get(&self, key: &str) -> SyncResult<String> {
        self.store
            .get(key)
            .ok_or_else(|| SyncError::NotFound(key.to_string()))
    }

    fn contains(&self, key: &str) -> SyncResult<bool> {
        Ok(self.store.read().contains(key))
    }
}

/// Asks the server for every lookup.
///
/// Each call is a blocking round trip to one node, so this is meant for
/// occasional reads of values that must be current, not for hot paths.
pub struct RemoteConfigService<T: ConfigTransport> {
    context: Arc<ConnectionContext>,
    transport: Arc<T>,
    chooser: Arc<dyn NodeChooser>,
}

impl<T: ConfigTransport> RemoteConfigService<T> {
    /// Creates a service sharing `chooser` with other users of the pool.
    pub fn new(
        context: Arc<ConnectionContext>,
        transport: Arc<T>,
        chooser: Arc<dyn NodeChooser>,
    ) -> Self {
        Self {
            context,
            transport,
            chooser,
        }
    }

    /// Fetches the full mapping from one node.
    pub fn fetch_all(&self) -> SyncResult<HashMap<String, String>> {
        let request = FetchRequest::new(self.context.credentials().clone());
        self.fetch(&request)
    }

    fn fetch(&self, request: &FetchRequest) -> SyncResult<HashMap<String, String>> {
        let node = self.chooser.next();
        match self.transport.fetch(&node, request).and_then(accepted_fetch) {
            Ok(response) => {
                self.chooser.report_success(&node);
                Ok(response.values)
            }
            Err(e) => {
                self.chooser.report_failure(&node);
                warn!(node = %node, error = %e, "remote config lookup failed");
                Err(e)
            }
        }
    }
}

impl<T: ConfigTransport> ConfigService for RemoteConfigService<T> {
    fn get(&self, key: &str) -> SyncResult<String> {
        let request =
            FetchRequest::for_keys(self.context.credentials().clone(), vec![key.to_string()]);
        self.fetch(&request)?
            .remove(key)
            .ok_or_else(|| SyncError::NotFound(key.to_string()))
    }
}

impl<T: ConfigTransport> std::fmt::Debug for RemoteConfigService<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfigService")
            .field("app", &self.context.app_code())
            .finish()
    }
}
