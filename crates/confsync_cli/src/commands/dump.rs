//! Dump command implementation.

use super::http_client::UreqClient;
use confsync_client::{ConnectionContext, HttpTransport, SyncEngine};
use serde::Serialize;
use std::collections::BTreeMap;

/// Resolved configuration of one application.
#[derive(Debug, Serialize)]
pub struct DumpResult {
    /// Application code.
    pub app_code: String,
    /// Sync mode used for the bootstrap.
    pub mode: String,
    /// Revision of the snapshot.
    pub revision: u64,
    /// Key/value pairs, sorted by key.
    pub values: BTreeMap<String, String>,
}

/// Runs the dump command.
pub fn run(context: ConnectionContext, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let transport = HttpTransport::for_context(UreqClient::new(), &context);
    let engine = SyncEngine::new(context, transport);

    let values = engine.start()?;
    let result = DumpResult {
        app_code: engine.context().app_code().to_string(),
        mode: engine.context().app_mode().to_string(),
        revision: engine.store().current_revision().get(),
        values: values.into_iter().collect(),
    };
    engine.stop()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        "text" => print_text(&result),
        other => return Err(format!("unknown format: {other} (expected text or json)").into()),
    }

    Ok(())
}

fn print_text(result: &DumpResult) {
    println!("=== {} ({}, {}) ===", result.app_code, result.mode, result.revision);
    if result.values.is_empty() {
        println!("(no values)");
        return;
    }
    let width = result.values.keys().map(String::len).max().unwrap_or(0);
    for (key, value) in &result.values {
        println!("{key:<width$} = {value}");
    }
}
