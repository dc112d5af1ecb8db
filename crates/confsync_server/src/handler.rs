//! Request handlers for config endpoints.

use crate::auth::AppAuthenticator;
use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::repository::{ChangeSet, ConfigRepository};
use confsync_protocol::{FetchRequest, FetchResponse, LongPollRequest, LongPollResponse};
use std::sync::Arc;
use tracing::{debug, warn};

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Configuration store (shared across all handlers).
    pub repository: Arc<ConfigRepository>,
    authenticator: AppAuthenticator,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, repository: Arc<ConfigRepository>) -> ServerResult<Self> {
        let authenticator = AppAuthenticator::new(&config)?;
        Ok(Self {
            config,
            repository,
            authenticator,
        })
    }
}

/// Handler for config requests.
///
/// Rejected credentials produce a response with `success = false` rather
/// than an error, so the client sees the reason.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a fetch request, honouring the optional key filter.
    pub fn handle_fetch(&self, request: FetchRequest) -> ServerResult<FetchResponse> {
        if let Err(e) = self.context.authenticator.authenticate(&request.credentials) {
            warn!(app = %request.credentials.app_code, error = %e, "fetch rejected");
            return Ok(FetchResponse::error(e.to_string()));
        }

        let app = &request.credentials.app_code;
        let (revision, mut values) = self.context.repository.snapshot(app);
        if let Some(keys) = &request.keys {
            values.retain(|key, _| keys.contains(key));
        }
        debug!(app = %app, revision = %revision, keys = values.len(), "fetch");
        Ok(FetchResponse::success(revision, values))
    }

    /// Handles a long-poll request.
    ///
    /// Answers at once if the app is already past the client's revision,
    /// otherwise holds the request until a change or the hold expires. The
    /// hold is the client's timeout capped at `max_hold`.
    pub fn handle_long_poll(&self, request: LongPollRequest) -> ServerResult<LongPollResponse> {
        if let Err(e) = self.context.authenticator.authenticate(&request.credentials) {
            warn!(app = %request.credentials.app_code, error = %e, "long poll rejected");
            return Ok(LongPollResponse::error(e.to_string()));
        }

        let app = &request.credentials.app_code;
        let hold = request.timeout().min(self.context.config.max_hold);
        let changes = self
            .context
            .repository
            .wait_for_change(app, request.revision, hold);
        debug!(
            app = %app,
            from = %request.revision,
            to = %changes.revision(),
            "long poll answered"
        );

        Ok(match changes {
            ChangeSet::Unchanged(revision) => LongPollResponse::unchanged(revision),
            ChangeSet::Diff {
                revision,
                values,
                removed,
            } => LongPollResponse::diff(revision, values, removed),
            ChangeSet::Full { revision, values } => LongPollResponse::full(revision, values),
        })
    }
}
