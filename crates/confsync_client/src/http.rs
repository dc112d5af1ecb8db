//! HTTP transport implementation.
//!
//! This module provides an HTTP-based transport for the sync engine.
//! The actual HTTP client is abstracted via a trait to allow different
//! implementations (ureq, reqwest, an in-process loopback, etc.).

use crate::config::{ConnectionContext, DEFAULT_REQUEST_TIMEOUT};
use crate::error::{SyncError, SyncResult};
use crate::node::Node;
use crate::transport::ConfigTransport;
use confsync_protocol::{
    decode_json, encode_json, FetchRequest, FetchResponse, LongPollRequest, LongPollResponse,
    FETCH_PATH, LONG_POLL_PATH,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Failure reported by an [`HttpClient`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// No response arrived within the request's timeout.
    #[error("request timed out: {0}")]
    TimedOut(String),

    /// Any other failure (connect, TLS, I/O, non-success status).
    #[error("{0}")]
    Failed(String),
}

impl From<String> for HttpError {
    fn from(message: String) -> Self {
        HttpError::Failed(message)
    }
}

impl From<&str> for HttpError {
    fn from(message: &str) -> Self {
        HttpError::Failed(message.to_string())
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request with a JSON body and returns the response body.
    ///
    /// The request must give up after `timeout`, reporting
    /// [`HttpError::TimedOut`].
    fn post(&self, url: &str, body: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, HttpError>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Interrupts in-flight requests, if the client is able to.
    fn abort(&self) {}
}

impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    fn post(&self, url: &str, body: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, HttpError> {
        (**self).post(url, body, timeout)
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }

    fn abort(&self) {
        (**self).abort()
    }
}

/// HTTP-based config transport.
///
/// Uses JSON encoding for request/response bodies.
pub struct HttpTransport<C: HttpClient> {
    client: C,
    connected: AtomicBool,
    last_error: RwLock<Option<String>>,
    request_timeout: Duration,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(client: C) -> Self {
        Self {
            client,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Creates a transport using the request timeout from `context`.
    pub fn for_context(client: C, context: &ConnectionContext) -> Self {
        Self::new(client).with_request_timeout(context.request_timeout())
    }

    /// Sets the budget for an ordinary request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Returns the wrapped client.
    pub fn client(&self) -> &C {
        &self.client
    }

    fn post_json<Req, Res>(
        &self,
        node: &Node,
        path: &str,
        request: &Req,
        timeout: Duration,
    ) -> SyncResult<Res>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let body = encode_json(request)?;
        let url = node.endpoint(path);
        trace!(url = %url, bytes = body.len(), "POST");

        let response_body = self.client.post(&url, body, timeout).map_err(|e| {
            *self.last_error.write() = Some(e.to_string());
            if !self.connected.load(Ordering::SeqCst) {
                // Closed while the request was in flight
                return SyncError::Cancelled;
            }
            match e {
                HttpError::TimedOut(_) => SyncError::Timeout,
                HttpError::Failed(message) => SyncError::transport_retryable(message),
            }
        })?;

        *self.last_error.write() = None;
        Ok(decode_json(&response_body)?)
    }
}

impl<C: HttpClient> ConfigTransport for HttpTransport<C> {
    fn fetch(&self, node: &Node, request: &FetchRequest) -> SyncResult<FetchResponse> {
        self.post_json(node, FETCH_PATH, request, self.request_timeout)
    }

    fn long_poll(&self, node: &Node, request: &LongPollRequest) -> SyncResult<LongPollResponse> {
        let timeout = request.timeout().saturating_add(self.request_timeout);
        self.post_json(node, LONG_POLL_PATH, request, timeout)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.client.abort();
        Ok(())
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request and returns the response body.
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String>;
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for Arc<S> {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        (**self).handle_post(path, body)
    }
}

/// A loopback HTTP client that routes requests directly to a config server.
///
/// Useful for testing without actual network overhead. The timeout is not
/// enforced; the server bounds its own long-poll holds.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, body: Vec<u8>, _timeout: Duration) -> Result<Vec<u8>, HttpError> {
        // Extract path from URL
        let path = url.find("/config/").map(|i| &url[i..]).unwrap_or(url);
        self.server.handle_post(path, &body).map_err(HttpError::Failed)
    }
}
