//! Credential checks for incoming requests.
//!
//! Secrets are never compared directly. At startup each registered secret is
//! turned into an HMAC-SHA256 tag under a per-process random key; a request
//! is accepted when the tag of its presented secret verifies against the
//! stored tag, which `hmac` does in constant time.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use confsync_protocol::Credentials;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

/// Validates app credentials.
#[derive(Clone)]
pub struct AppAuthenticator {
    key: [u8; 32],
    tags: HashMap<String, [u8; 32]>,
}

impl AppAuthenticator {
    /// Creates an authenticator for the apps registered in `config`.
    pub fn new(config: &ServerConfig) -> ServerResult<Self> {
        let mut auth = Self {
            key: rand::random(),
            tags: HashMap::with_capacity(config.apps.len()),
        };
        for (app_code, secret) in &config.apps {
            let tag = auth.sign(app_code, secret)?.finalize().into_bytes().into();
            auth.tags.insert(app_code.clone(), tag);
        }
        Ok(auth)
    }

    /// Returns true if `app_code` is registered.
    pub fn knows(&self, app_code: &str) -> bool {
        self.tags.contains_key(app_code)
    }

    /// Checks `credentials` against the registered secret.
    pub fn authenticate(&self, credentials: &Credentials) -> ServerResult<()> {
        let expected = self.tags.get(&credentials.app_code).ok_or_else(|| {
            ServerError::AuthenticationFailed(format!("unknown app: {}", credentials.app_code))
        })?;
        self.sign(&credentials.app_code, &credentials.secret_key)?
            .verify_slice(expected)
            .map_err(|_| ServerError::AuthenticationFailed("invalid secret key".into()))
    }

    fn sign(&self, app_code: &str, secret: &str) -> ServerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| ServerError::Internal(format!("hmac key: {e}")))?;
        mac.update(app_code.as_bytes());
        mac.update(&[0]);
        mac.update(secret.as_bytes());
        Ok(mac)
    }
}

impl std::fmt::Debug for AppAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppAuthenticator")
            .field("apps", &self.tags.len())
            .finish()
    }
}
