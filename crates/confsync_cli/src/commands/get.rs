//! Get command implementation.

use super::http_client::UreqClient;
use confsync_client::{
    ConfigService, ConnectionContext, HttpTransport, NodeChooser, RemoteConfigService,
    RoundRobinChooser, SyncResult,
};
use std::sync::Arc;

/// Runs the get command.
///
/// Asks one node at a time, moving on to the next after a retryable
/// failure, until every node has been tried once.
pub fn run(
    context: ConnectionContext,
    key: &str,
    default: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let attempts = context.nodes().len();
    let transport = Arc::new(HttpTransport::for_context(UreqClient::new(), &context));
    let chooser: Arc<dyn NodeChooser> =
        Arc::new(RoundRobinChooser::new(context.nodes().iter().cloned()));
    let service = RemoteConfigService::new(Arc::new(context), transport, chooser);

    let lookup = || -> SyncResult<String> {
        match default {
            Some(default) => service.get_or(key, default),
            None => service.get(key),
        }
    };

    let mut result = lookup();
    let mut tried = 1;
    while tried < attempts && result.as_ref().is_err_and(|e| e.is_retryable()) {
        result = lookup();
        tried += 1;
    }

    println!("{}", result?);
    Ok(())
}
