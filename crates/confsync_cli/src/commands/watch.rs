//! Watch command implementation.

use super::http_client::UreqClient;
use confsync_client::{
    ChangeEvent, ConnectionContext, HandlerResult, HttpTransport, SyncEngine, SyncError,
};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Runs the watch command.
///
/// Without a duration this keeps running until the process is interrupted.
pub fn run(
    context: ConnectionContext,
    duration: Option<Duration>,
    keys: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let transport = HttpTransport::for_context(UreqClient::new(), &context);
    let engine = SyncEngine::new(context, transport);

    engine.register(move |event: &ChangeEvent| -> HandlerResult {
        let revision = event.current.revision();
        for change in &event.changes {
            if !keys.is_empty() && !keys.contains(&change.key) {
                continue;
            }
            match (&change.old, &change.new) {
                (None, Some(new)) => info!(%revision, key = %change.key, value = %new, "added"),
                (Some(_), None) => info!(%revision, key = %change.key, "removed"),
                (old, new) => info!(
                    %revision,
                    key = %change.key,
                    old = old.as_deref().unwrap_or_default(),
                    new = new.as_deref().unwrap_or_default(),
                    "changed"
                ),
            }
        }
        Ok(())
    });
    engine.set_failure_handler(|error: &SyncError| {
        debug!(error = %error, "failure handler notified");
    });

    let values = engine.start()?;
    info!(
        app = engine.context().app_code(),
        mode = %engine.context().app_mode(),
        keys = values.len(),
        revision = %engine.store().current_revision(),
        "watching for changes"
    );

    match duration {
        Some(duration) => thread::sleep(duration),
        None => loop {
            thread::park();
        },
    }

    engine.stop()?;
    let stats = engine.stats();
    info!(
        cycles = stats.cycles_completed,
        updates = stats.updates_applied,
        failures = stats.failures,
        "stopped"
    );
    Ok(())
}
