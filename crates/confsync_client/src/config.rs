//! Connection options and the validated connection context.
//!
//! All intervals are normalized to [`Duration`] at this boundary. Bare
//! numbers are seconds; textual values may carry an explicit `s` or `ms`
//! suffix, so `"90"`, `"90s"` and `"90000ms"` all mean the same thing.

use crate::deferred_log::DeferredLog;
use crate::error::{SyncError, SyncResult};
use crate::node::Node;
use confsync_protocol::Credentials;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Smallest pull interval accepted in long-polling mode.
pub const MIN_LONG_POLL_PULL_INTERVAL: Duration = Duration::from_secs(300);

/// Smallest long-poll hold accepted in long-polling mode.
pub const MIN_LONG_POLLING_TIMEOUT: Duration = Duration::from_secs(90);

const DEFAULT_PULL_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_LONG_POLLING_TIMEOUT: Duration = Duration::from_secs(90);
/// Default budget for a single fetch request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest interval or timeout accepted anywhere in the options (30 days).
pub const MAX_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const PROPERTY_PREFIX: &str = "config.center.";

/// Synchronization strategy, derived from `enable_dynamic_push`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppMode {
    /// Fetch the full configuration on a fixed timer.
    Pulling,
    /// Hold a request open until the server reports a change.
    LongPolling,
}

impl AppMode {
    /// Returns the canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AppMode::Pulling => "PULLING",
            AppMode::LongPolling => "LONG_POLLING",
        }
    }
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw, unvalidated connection options.
///
/// Deserializes from JSON with camelCase names (`appCode`, `serverUrl`,
/// `pullInterval`, ...). `serverUrl` may be a delimited string or a list.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    /// Application code.
    #[serde(default)]
    pub app_code: String,
    /// Secret key.
    #[serde(default)]
    pub secret_key: String,
    /// Candidate server endpoints.
    #[serde(default, deserialize_with = "deserialize_server_urls")]
    pub server_url: Vec<String>,
    /// Enables long-polling mode.
    #[serde(default)]
    pub enable_dynamic_push: bool,
    /// Makes bootstrap failures and missing required keys fatal.
    #[serde(default)]
    pub check_config_exist: bool,
    /// Pull period (also the reconciliation period in long-polling mode).
    #[serde(
        default = "default_pull_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub pull_interval: Duration,
    /// Server-side hold duration for a long-poll request.
    #[serde(
        default = "default_long_polling_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub long_polling_timeout: Duration,
    /// Keys the application cannot run without.
    #[serde(default)]
    pub required_keys: Vec<String>,
    /// Budget for a single fetch request.
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,
    /// Backoff policy for long-poll failures.
    #[serde(skip)]
    pub retry: RetryConfig,
}

fn default_pull_interval() -> Duration {
    DEFAULT_PULL_INTERVAL
}

fn default_long_polling_timeout() -> Duration {
    DEFAULT_LONG_POLLING_TIMEOUT
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

impl ConnectionOptions {
    /// Creates options with defaults for everything but the credentials and
    /// endpoints.
    pub fn new(
        app_code: impl Into<String>,
        secret_key: impl Into<String>,
        server_url: &str,
    ) -> Self {
        Self {
            app_code: app_code.into(),
            secret_key: secret_key.into(),
            server_url: parse_server_urls(server_url),
            enable_dynamic_push: false,
            check_config_exist: false,
            pull_interval: DEFAULT_PULL_INTERVAL,
            long_polling_timeout: DEFAULT_LONG_POLLING_TIMEOUT,
            required_keys: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }

    /// Replaces the endpoint list.
    pub fn with_server_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.server_url = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Enables or disables long-polling mode.
    pub fn with_dynamic_push(mut self, enabled: bool) -> Self {
        self.enable_dynamic_push = enabled;
        self
    }

    /// Sets whether missing configuration is fatal at bootstrap.
    pub fn with_check_config_exist(mut self, check: bool) -> Self {
        self.check_config_exist = check;
        self
    }

    /// Sets the pull interval.
    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = interval;
        self
    }

    /// Sets the long-poll hold duration.
    pub fn with_long_polling_timeout(mut self, timeout: Duration) -> Self {
        self.long_polling_timeout = timeout;
        self
    }

    /// Sets the keys that must exist on the server.
    pub fn with_required_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Parses options from a JSON document.
    pub fn from_json(bytes: &[u8]) -> SyncResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| SyncError::config(e.to_string()))
    }

    /// Reads options from flat `config.center.*` properties.
    ///
    /// Returns `Ok(None)` when `config.center.enabled` is not `true`; the
    /// reason is queued on `log` since this typically runs before a tracing
    /// subscriber is installed.
    pub fn from_properties(
        properties: &HashMap<String, String>,
        log: &mut DeferredLog,
    ) -> SyncResult<Option<Self>> {
        let get = |name: &str| {
            properties
                .get(&format!("{PROPERTY_PREFIX}{name}"))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        let require = |name: &str| {
            get(name).ok_or_else(|| {
                SyncError::config(format!("required property {PROPERTY_PREFIX}{name} is missing"))
            })
        };

        let enabled = get("enabled").map(parse_bool).transpose()?.unwrap_or(false);
        if !enabled {
            log.warn(format!(
                "config center is disabled; set {PROPERTY_PREFIX}enabled=true to initialize the client"
            ));
            return Ok(None);
        }

        let mut options = Self::new(require("appCode")?, require("secretKey")?, require("serverUrl")?);

        if let Some(raw) = get("enableDynamicPush") {
            options.enable_dynamic_push = parse_bool(raw)?;
        }
        if let Some(raw) = get("checkConfigExist") {
            options.check_config_exist = parse_bool(raw)?;
        }
        if let Some(raw) = get("pullInterval") {
            options.pull_interval = parse_duration(raw)?;
        }
        if let Some(raw) = get("longPollingTimeout") {
            options.long_polling_timeout = parse_duration(raw)?;
        }
        if let Some(raw) = get("requestTimeout") {
            options.request_timeout = parse_duration(raw)?;
        }
        if let Some(raw) = get("requiredKeys") {
            options.required_keys = raw
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }

        log.debug(format!(
            "loaded config center properties for app {}",
            options.app_code
        ));
        Ok(Some(options))
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("app_code", &self.app_code)
            .field("secret_key", &"<redacted>")
            .field("server_url", &self.server_url)
            .field("enable_dynamic_push", &self.enable_dynamic_push)
            .field("check_config_exist", &self.check_config_exist)
            .field("pull_interval", &self.pull_interval)
            .field("long_polling_timeout", &self.long_polling_timeout)
            .field("required_keys", &self.required_keys)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Validated, immutable connection descriptor.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    credentials: Credentials,
    nodes: Vec<Node>,
    app_mode: AppMode,
    check_config_exist: bool,
    pull_interval: Duration,
    long_polling_timeout: Duration,
    required_keys: Vec<String>,
    request_timeout: Duration,
    retry: RetryConfig,
}

impl ConnectionContext {
    /// Validates `options` and derives the operating mode.
    pub fn build(options: ConnectionOptions) -> SyncResult<Self> {
        if options.app_code.trim().is_empty() {
            return Err(SyncError::config("appCode must not be empty"));
        }
        if options.secret_key.is_empty() {
            return Err(SyncError::config("secretKey must not be empty"));
        }

        let nodes: Vec<Node> = options
            .server_url
            .iter()
            .flat_map(|raw| parse_server_urls(raw))
            .map(Node::new)
            .collect();
        if nodes.is_empty() {
            return Err(SyncError::config("serverUrl must name at least one endpoint"));
        }

        let app_mode = if options.enable_dynamic_push {
            AppMode::LongPolling
        } else {
            AppMode::Pulling
        };

        if options.pull_interval.is_zero() {
            return Err(SyncError::config("pullInterval must be positive"));
        }
        if options.request_timeout.is_zero() {
            return Err(SyncError::config("requestTimeout must be positive"));
        }
        for (name, value) in [
            ("pullInterval", options.pull_interval),
            ("longPollingTimeout", options.long_polling_timeout),
            ("requestTimeout", options.request_timeout),
        ] {
            check_upper_bound(name, value)?;
        }
        options.retry.validate()?;
        if app_mode == AppMode::LongPolling {
            if options.pull_interval < MIN_LONG_POLL_PULL_INTERVAL {
                return Err(SyncError::config(format!(
                    "pullInterval must be at least {}s in long-polling mode, got {}s",
                    MIN_LONG_POLL_PULL_INTERVAL.as_secs(),
                    options.pull_interval.as_secs_f64()
                )));
            }
            if options.long_polling_timeout < MIN_LONG_POLLING_TIMEOUT {
                return Err(SyncError::config(format!(
                    "longPollingTimeout must be at least {}s, got {}s",
                    MIN_LONG_POLLING_TIMEOUT.as_secs(),
                    options.long_polling_timeout.as_secs_f64()
                )));
            }
        }

        Ok(Self {
            credentials: Credentials::new(options.app_code.trim(), options.secret_key),
            nodes,
            app_mode,
            check_config_exist: options.check_config_exist,
            pull_interval: options.pull_interval,
            long_polling_timeout: options.long_polling_timeout,
            required_keys: options.required_keys,
            request_timeout: options.request_timeout,
            retry: options.retry,
        })
    }

    /// Returns the credential pair.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Returns the application code.
    pub fn app_code(&self) -> &str {
        &self.credentials.app_code
    }

    /// Returns the configured endpoints, in order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Returns the derived operating mode.
    pub fn app_mode(&self) -> AppMode {
        self.app_mode
    }

    /// Returns whether missing configuration is fatal at bootstrap.
    pub fn check_config_exist(&self) -> bool {
        self.check_config_exist
    }

    /// Returns the pull interval.
    pub fn pull_interval(&self) -> Duration {
        self.pull_interval
    }

    /// Returns the long-poll hold duration.
    pub fn long_polling_timeout(&self) -> Duration {
        self.long_polling_timeout
    }

    /// Returns the keys that must exist on the server.
    pub fn required_keys(&self) -> &[String] {
        &self.required_keys
    }

    /// Returns the per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Returns the transport timeout for a long-poll request: the hold
    /// duration plus the ordinary request budget as grace.
    pub fn long_poll_request_timeout(&self) -> Duration {
        self.long_polling_timeout.saturating_add(self.request_timeout)
    }

    /// Returns the retry configuration.
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }
}

/// Configuration for retry behavior after transport failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given bounds.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Checks that the policy actually backs off.
    ///
    /// The multiplier must be finite and at least 1, the initial delay
    /// positive, and `max_delay` between `initial_delay` and [`MAX_DURATION`].
    pub fn validate(&self) -> SyncResult<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(SyncError::config(format!(
                "retry backoff multiplier must be a finite number >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_delay.is_zero() {
            return Err(SyncError::config("retry initial delay must be positive"));
        }
        if self.max_delay < self.initial_delay {
            return Err(SyncError::config(
                "retry max delay must not be shorter than the initial delay",
            ));
        }
        check_upper_bound("retry max delay", self.max_delay)
    }

    /// Calculates the delay before retry number `attempt` (1-indexed).
    ///
    /// Out-of-range settings are clamped rather than trusted: the multiplier
    /// is at least 1 and the result never exceeds `max_delay` (plus jitter).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let multiplier = if self.backoff_multiplier.is_finite() {
            self.backoff_multiplier.max(1.0)
        } else {
            1.0
        };
        let max_secs = self.max_delay.as_secs_f64();
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);
        let delay_secs = if base_delay.is_finite() {
            base_delay.min(max_secs)
        } else {
            max_secs
        };

        let delay_secs = if self.add_jitter {
            // Up to 25% on top of the capped delay
            delay_secs + delay_secs * 0.25 * rand::random::<f64>()
        } else {
            delay_secs
        };
        Duration::try_from_secs_f64(delay_secs).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Attempt counter over a [`RetryConfig`].
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Returns the next delay and advances the attempt counter.
    pub(crate) fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.config.delay_for_attempt(self.attempt)
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

fn check_upper_bound(name: &str, value: Duration) -> SyncResult<()> {
    if value > MAX_DURATION {
        return Err(SyncError::config(format!(
            "{name} must be at most {}s, got {}s",
            MAX_DURATION.as_secs(),
            value.as_secs()
        )));
    }
    Ok(())
}

/// Splits a `,`/`;` delimited endpoint list.
pub fn parse_server_urls(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(|s| s.trim().trim_end_matches('/'))
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parses a duration: bare seconds, or a number with an `s` / `ms` suffix.
pub fn parse_duration(raw: &str) -> SyncResult<Duration> {
    let raw = raw.trim();
    let invalid = || SyncError::config(format!("invalid duration: {raw:?}"));

    let (digits, millis) = if let Some(n) = raw.strip_suffix("ms") {
        (n, true)
    } else if let Some(n) = raw.strip_suffix('s') {
        (n, false)
    } else {
        (raw, false)
    };
    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

fn parse_bool(raw: &str) -> SyncResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(SyncError::config(format!("invalid boolean: {raw:?}"))),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawServerUrls {
    One(String),
    Many(Vec<String>),
}

fn deserialize_server_urls<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<String>, D::Error> {
    Ok(match RawServerUrls::deserialize(de)? {
        RawServerUrls::One(raw) => parse_server_urls(&raw),
        RawServerUrls::Many(list) => list.iter().flat_map(|s| parse_server_urls(s)).collect(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Secs(u64),
    Text(String),
}

fn deserialize_duration<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
    match RawDuration::deserialize(de)? {
        RawDuration::Secs(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}
