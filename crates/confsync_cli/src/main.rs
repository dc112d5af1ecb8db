//! confsync CLI
//!
//! Command-line client for a confsync configuration server.
//!
//! # Commands
//!
//! - `get` - Look up a single key directly on the server
//! - `dump` - Bootstrap and print the full resolved configuration
//! - `watch` - Keep a snapshot in sync and log every applied change
//!
//! Connection settings come from `--config` (a JSON document or a
//! `.properties` file with `config.center.*` keys), overridden by flags and
//! `CONFSYNC_*` environment variables.

mod commands;

use clap::{Parser, Subcommand};
use confsync_client::{
    parse_duration, parse_server_urls, ConnectionContext, ConnectionOptions, DeferredLog,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// confsync command-line client.
#[derive(Parser)]
#[command(name = "confsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Connection settings file (.json or .properties)
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Application code
    #[arg(global = true, long, env = "CONFSYNC_APP_CODE")]
    app_code: Option<String>,

    /// Application secret key
    #[arg(global = true, long, env = "CONFSYNC_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Server endpoints, separated by commas or semicolons
    #[arg(global = true, short, long, env = "CONFSYNC_SERVER_URL")]
    server_url: Option<String>,

    /// Use long polling instead of periodic pulls
    #[arg(global = true, long)]
    dynamic_push: bool,

    /// Fail when the configuration or a required key is missing
    #[arg(global = true, long)]
    check_config_exist: bool,

    /// Pull interval (e.g. 30, 30s, 500ms)
    #[arg(global = true, long, value_parser = duration_arg)]
    pull_interval: Option<Duration>,

    /// Keys that must be present after bootstrap
    #[arg(global = true, long = "require", value_delimiter = ',')]
    required_keys: Vec<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look up a single key on the server
    Get {
        /// Configuration key
        key: String,

        /// Value to print when the key is absent
        #[arg(short, long)]
        default: Option<String>,
    },

    /// Print the full configuration after bootstrap
    Dump {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Stay in sync and log every applied change
    Watch {
        /// Stop after this many seconds (runs until interrupted if unset)
        #[arg(short, long)]
        duration: Option<u64>,

        /// Only report changes to these keys
        #[arg(short, long, value_delimiter = ',')]
        keys: Vec<String>,
    },

    /// Show version information
    Version,
}

fn duration_arg(raw: &str) -> Result<Duration, String> {
    parse_duration(raw).map_err(|e| e.to_string())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Options are read before logging is up, so warnings are queued
    let mut log = DeferredLog::new();
    let options = match cli.command {
        Commands::Version => None,
        _ => Some(load_options(&cli, &mut log)?),
    };

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    log.replay();

    let Some(options) = options else {
        println!("confsync CLI v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    };
    let context = ConnectionContext::build(options)?;

    match cli.command {
        Commands::Get { key, default } => {
            commands::get::run(context, &key, default.as_deref())?;
        }
        Commands::Dump { format } => {
            commands::dump::run(context, &format)?;
        }
        Commands::Watch { duration, keys } => {
            commands::watch::run(context, duration.map(Duration::from_secs), keys)?;
        }
        Commands::Version => {}
    }

    Ok(())
}

/// Builds connection options from the settings file, then applies flags.
fn load_options(
    cli: &Cli,
    log: &mut DeferredLog,
) -> Result<ConnectionOptions, Box<dyn std::error::Error>> {
    let mut options = match &cli.config {
        Some(path) => Some(read_options_file(path, log)?),
        None => None,
    };

    if let Some(options) = options.as_mut() {
        if let Some(app_code) = &cli.app_code {
            options.app_code = app_code.clone();
        }
        if let Some(secret_key) = &cli.secret_key {
            options.secret_key = secret_key.clone();
        }
        if let Some(server_url) = &cli.server_url {
            options.server_url = parse_server_urls(server_url);
        }
    }

    let mut options = match options {
        Some(options) => options,
        None => {
            let app_code = cli.app_code.clone().ok_or("--app-code is required")?;
            let secret_key = cli.secret_key.clone().ok_or("--secret-key is required")?;
            let server_url = cli.server_url.as_deref().ok_or("--server-url is required")?;
            ConnectionOptions::new(app_code, secret_key, server_url)
        }
    };

    if cli.dynamic_push {
        options.enable_dynamic_push = true;
    }
    if cli.check_config_exist {
        options.check_config_exist = true;
    }
    if let Some(interval) = cli.pull_interval {
        options.pull_interval = interval;
    }
    if !cli.required_keys.is_empty() {
        options.required_keys = cli.required_keys.clone();
    }

    log.debug(format!("connection options: {options:?}"));
    Ok(options)
}

fn read_options_file(
    path: &Path,
    log: &mut DeferredLog,
) -> Result<ConnectionOptions, Box<dyn std::error::Error>> {
    let bytes =
        std::fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;

    if path.extension().is_some_and(|ext| ext == "properties") {
        let text = String::from_utf8(bytes)?;
        let properties = parse_properties(&text);
        log.debug(format!(
            "read {} properties from {}",
            properties.len(),
            path.display()
        ));
        ConnectionOptions::from_properties(&properties, log)?
            .ok_or_else(|| format!("config center is disabled in {}", path.display()).into())
    } else {
        Ok(ConnectionOptions::from_json(&bytes)?)
    }
}

/// Parses `key=value` lines, skipping blanks and `#`/`!` comments.
fn parse_properties(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=').or_else(|| line.split_once(':'))?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}
