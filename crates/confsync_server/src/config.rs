//! Server configuration.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Longest a long-poll request is held by default.
pub const DEFAULT_MAX_HOLD: Duration = Duration::from_secs(90);

/// Per-app change records kept for computing diffs.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// Configuration for the config server.
#[derive(Clone)]
pub struct ServerConfig {
    /// Upper bound on how long a long-poll request is held.
    pub max_hold: Duration,
    /// Change records kept per app. Clients further behind get the full
    /// mapping instead of a diff.
    pub history_limit: usize,
    /// Registered applications, app code to secret key.
    pub apps: HashMap<String, String>,
}

impl ServerConfig {
    /// Creates a configuration with no registered apps.
    pub fn new() -> Self {
        Self {
            max_hold: DEFAULT_MAX_HOLD,
            history_limit: DEFAULT_HISTORY_LIMIT,
            apps: HashMap::new(),
        }
    }

    /// Sets the maximum long-poll hold.
    pub fn with_max_hold(mut self, max_hold: Duration) -> Self {
        self.max_hold = max_hold;
        self
    }

    /// Sets the per-app history limit (minimum 1).
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Registers an application.
    pub fn with_app(mut self, app_code: impl Into<String>, secret_key: impl Into<String>) -> Self {
        self.apps.insert(app_code.into(), secret_key.into());
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut apps: Vec<_> = self.apps.keys().collect();
        apps.sort();
        f.debug_struct("ServerConfig")
            .field("max_hold", &self.max_hold)
            .field("history_limit", &self.history_limit)
            .field("apps", &apps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_hold, Duration::from_secs(90));
        assert!(config.apps.is_empty());
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_max_hold(Duration::from_secs(30))
            .with_history_limit(0)
            .with_app("billing", "s3cret");

        assert_eq!(config.max_hold, Duration::from_secs(30));
        assert_eq!(config.history_limit, 1);
        assert_eq!(config.apps.get("billing").map(String::as_str), Some("s3cret"));
    }

    #[test]
    fn debug_hides_secrets() {
        let config = ServerConfig::new().with_app("billing", "s3cret");
        let debug = format!("{config:?}");
        assert!(debug.contains("billing"));
        assert!(!debug.contains("s3cret"));
    }
}
