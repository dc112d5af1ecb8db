//! Protocol messages for configuration sync.

use crate::codec::{decode_json, encode_json};
use crate::error::ProtocolResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Path of the full/partial fetch endpoint.
pub const FETCH_PATH: &str = "/config/fetch";

/// Path of the long-poll endpoint.
pub const LONG_POLL_PATH: &str = "/config/long-poll";

/// Monotonic marker of a configuration state.
///
/// Assigned by the server; a client only compares revisions, it never
/// interprets them.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    /// Revision of a snapshot that was never populated.
    pub const ZERO: Revision = Revision(0);

    /// Creates a revision from its raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the revision that follows this one.
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns true if `self` is strictly newer than `other`.
    pub fn is_newer_than(self, other: Revision) -> bool {
        self > other
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Credential pair sent with every request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Application code.
    pub app_code: String,
    /// Secret key. Never printed.
    pub secret_key: String,
}

impl Credentials {
    /// Creates a credential pair.
    pub fn new(app_code: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            app_code: app_code.into(),
            secret_key: secret_key.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("app_code", &self.app_code)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Request for the current configuration of an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    /// Caller credentials.
    #[serde(flatten)]
    pub credentials: Credentials,
    /// Restricts the response to these keys. `None` fetches everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    /// Revision the caller already holds, for server-side logging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_revision: Option<Revision>,
}

impl FetchRequest {
    /// Creates a request for the full mapping.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            keys: None,
            known_revision: None,
        }
    }

    /// Creates a request restricted to the given keys.
    pub fn for_keys(credentials: Credentials, keys: Vec<String>) -> Self {
        Self {
            credentials,
            keys: Some(keys),
            known_revision: None,
        }
    }

    /// Sets the revision the caller already holds.
    pub fn with_known_revision(mut self, revision: Revision) -> Self {
        self.known_revision = Some(revision);
        self
    }

    /// Encodes to JSON.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_json(self)
    }

    /// Decodes from JSON.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_json(bytes)
    }
}

/// Response to a [`FetchRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    /// Whether the request was served.
    pub success: bool,
    /// Error message if it was not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Revision of the returned values.
    #[serde(default)]
    pub revision: Revision,
    /// Key/value pairs. Keys unknown to the server are simply absent.
    #[serde(default)]
    pub values: HashMap<String, String>,
}

impl FetchResponse {
    /// Creates a successful response.
    pub fn success(revision: Revision, values: HashMap<String, String>) -> Self {
        Self {
            success: true,
            error: None,
            revision,
            values,
        }
    }

    /// Creates a failed response.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            revision: Revision::ZERO,
            values: HashMap::new(),
        }
    }

    /// Encodes to JSON.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_json(self)
    }

    /// Decodes from JSON.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_json(bytes)
    }
}

/// Request held open by the server until a change or the timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LongPollRequest {
    /// Caller credentials.
    #[serde(flatten)]
    pub credentials: Credentials,
    /// Only notify about revisions newer than this one.
    pub revision: Revision,
    /// Requested hold duration in seconds.
    pub timeout_secs: u64,
}

impl LongPollRequest {
    /// Creates a long-poll request.
    pub fn new(credentials: Credentials, revision: Revision, timeout: Duration) -> Self {
        Self {
            credentials,
            revision,
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Returns the requested hold duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Encodes to JSON.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_json(self)
    }

    /// Decodes from JSON.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_json(bytes)
    }
}

fn default_true() -> bool {
    true
}

/// Response to a [`LongPollRequest`].
///
/// When `changed` is set, `values` carries either the full mapping
/// (`full == true`) or only the keys that changed, with deleted keys listed
/// in `removed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LongPollResponse {
    /// Whether the request was served.
    #[serde(default = "default_true")]
    pub success: bool,
    /// Error message if it was not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether anything changed since the requested revision.
    pub changed: bool,
    /// Server revision at response time.
    #[serde(default)]
    pub revision: Revision,
    /// Changed (or all) key/value pairs.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub values: HashMap<String, String>,
    /// Keys deleted since the requested revision.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
    /// Whether `values` is the complete mapping.
    #[serde(default)]
    pub full: bool,
}

impl LongPollResponse {
    /// Creates a "no change" response.
    pub fn unchanged(revision: Revision) -> Self {
        Self {
            success: true,
            error: None,
            changed: false,
            revision,
            values: HashMap::new(),
            removed: Vec::new(),
            full: false,
        }
    }

    /// Creates a response carrying only the changed keys.
    pub fn diff(
        revision: Revision,
        values: HashMap<String, String>,
        removed: Vec<String>,
    ) -> Self {
        Self {
            success: true,
            error: None,
            changed: true,
            revision,
            values,
            removed,
            full: false,
        }
    }

    /// Creates a response carrying the full mapping.
    pub fn full(revision: Revision, values: HashMap<String, String>) -> Self {
        Self {
            success: true,
            error: None,
            changed: true,
            revision,
            values,
            removed: Vec::new(),
            full: true,
        }
    }

    /// Creates a failed response.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::unchanged(Revision::ZERO)
        }
    }

    /// Builds the mapping that results from applying this response to `base`.
    ///
    /// A full response replaces `base` entirely; a diff overlays changed keys
    /// and drops removed ones.
    pub fn merged_onto(&self, base: &HashMap<String, String>) -> HashMap<String, String> {
        if self.full {
            return self.values.clone();
        }
        let mut merged = base.clone();
        for key in &self.removed {
            merged.remove(key);
        }
        for (key, value) in &self.values {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Encodes to JSON.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_json(self)
    }

    /// Decodes from JSON.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_json(bytes)
    }
}
