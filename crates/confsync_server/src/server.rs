//! Main config server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::repository::ConfigRepository;
use confsync_protocol::{
    FetchRequest, FetchResponse, LongPollRequest, LongPollResponse, Revision, FETCH_PATH,
    LONG_POLL_PATH,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// The config server.
///
/// Serves fetch and long-poll requests from an in-memory
/// [`ConfigRepository`]. It has no listener of its own: an HTTP front end
/// (or an in-process loopback) passes request bodies to
/// [`handle_post`](Self::handle_post).
///
/// # Example
///
/// ```
/// use confsync_server::{ConfigServer, ServerConfig};
///
/// let server = ConfigServer::new(ServerConfig::new().with_app("billing", "s3cret")).unwrap();
/// server.publish("billing", "db.url", "postgres://db");
/// assert_eq!(server.revision("billing").get(), 1);
/// ```
pub struct ConfigServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl ConfigServer {
    /// Creates a new config server with an empty repository.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let repository = Arc::new(ConfigRepository::new(config.history_limit));
        Self::with_repository(config, repository)
    }

    /// Creates a config server over an existing repository.
    pub fn with_repository(
        config: ServerConfig,
        repository: Arc<ConfigRepository>,
    ) -> ServerResult<Self> {
        let context = Arc::new(HandlerContext::new(config, repository)?);
        let handler = RequestHandler::new(Arc::clone(&context));
        Ok(Self { handler, context })
    }

    /// Returns the repository.
    pub fn repository(&self) -> &Arc<ConfigRepository> {
        &self.context.repository
    }

    /// Sets one key.
    pub fn publish(&self, app: &str, key: &str, value: &str) -> Revision {
        self.context.repository.publish(app, key, value)
    }

    /// Removes one key.
    pub fn remove(&self, app: &str, key: &str) -> Option<Revision> {
        self.context.repository.remove(app, key)
    }

    /// Replaces the whole mapping of an app.
    pub fn publish_all(&self, app: &str, values: HashMap<String, String>) -> Revision {
        self.context.repository.publish_all(app, values)
    }

    /// Returns the current revision of an app.
    pub fn revision(&self, app: &str) -> Revision {
        self.context.repository.revision(app)
    }

    /// Handles a fetch request.
    pub fn handle_fetch(&self, request: FetchRequest) -> Result<FetchResponse, String> {
        self.handler.handle_fetch(request).map_err(|e| e.to_string())
    }

    /// Handles a long-poll request.
    pub fn handle_long_poll(&self, request: LongPollRequest) -> Result<LongPollResponse, String> {
        self.handler
            .handle_long_poll(request)
            .map_err(|e| e.to_string())
    }

    /// Handles a POST with a JSON body (dispatches on the path).
    pub fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        self.route(path, body).map_err(|e| {
            warn!(path, error = %e, "request failed");
            e.to_string()
        })
    }

    fn route(&self, path: &str, body: &[u8]) -> ServerResult<Vec<u8>> {
        let path = path.split('?').next().unwrap_or(path);
        match path {
            FETCH_PATH => {
                let request = FetchRequest::decode(body)?;
                Ok(self.handler.handle_fetch(request)?.encode()?)
            }
            LONG_POLL_PATH => {
                let request = LongPollRequest::decode(body)?;
                Ok(self.handler.handle_long_poll(request)?.encode()?)
            }
            other => Err(ServerError::UnknownEndpoint(other.to_string())),
        }
    }

    /// Releases every held long-poll and makes new ones return at once.
    pub fn shutdown(&self) {
        self.context.repository.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confsync_protocol::Credentials;
    use std::time::Duration;

    fn server() -> ConfigServer {
        ConfigServer::new(ServerConfig::new().with_app("billing", "s3cret")).unwrap()
    }

    fn creds() -> Credentials {
        Credentials::new("billing", "s3cret")
    }

    #[test]
    fn server_lifecycle() {
        let server = server();
        assert_eq!(server.revision("billing"), Revision::ZERO);
        server.publish("billing", "foo", "bar");
        assert_eq!(server.revision("billing"), Revision::new(1));
        assert_eq!(server.remove("billing", "foo"), Some(Revision::new(2)));
    }

    #[test]
    fn post_routing() {
        let server = server();
        server.publish("billing", "foo", "bar");

        let body = FetchRequest::new(creds()).encode().unwrap();
        let response =
            FetchResponse::decode(&server.handle_post(FETCH_PATH, &body).unwrap()).unwrap();
        assert_eq!(response.values["foo"], "bar");

        let body = LongPollRequest::new(creds(), Revision::ZERO, Duration::from_secs(1))
            .encode()
            .unwrap();
        let response =
            LongPollResponse::decode(&server.handle_post(LONG_POLL_PATH, &body).unwrap()).unwrap();
        assert!(response.changed);
        assert_eq!(response.revision, Revision::new(1));
    }

    #[test]
    fn post_errors() {
        let server = server();
        let err = server.handle_post("/config/push", b"{}").unwrap_err();
        assert!(err.contains("unknown endpoint"));

        let err = server.handle_post(FETCH_PATH, b"not json").unwrap_err();
        assert!(err.contains("invalid request"));
    }

    #[test]
    fn shutdown_releases_long_poll() {
        let server = server();
        server.shutdown();
        let response = server
            .handle_long_poll(LongPollRequest::new(
                creds(),
                Revision::ZERO,
                Duration::from_secs(60),
            ))
            .unwrap();
        assert!(!response.changed);
    }

    #[test]
    fn shared_repository() {
        let repository = Arc::new(ConfigRepository::default());
        let server = ConfigServer::with_repository(
            ServerConfig::new().with_app("billing", "s3cret"),
            Arc::clone(&repository),
        )
        .unwrap();

        repository.publish("billing", "foo", "bar");
        let response = server.handle_fetch(FetchRequest::new(creds())).unwrap();
        assert_eq!(response.values["foo"], "bar");
    }
}
