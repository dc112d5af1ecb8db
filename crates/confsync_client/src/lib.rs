//! # confsync Client
//!
//! Keeps a local snapshot of named configuration values in sync with a
//! remote configuration authority.
//!
//! This crate provides:
//! - Connection context (credentials, endpoints, mode, intervals)
//! - Node chooser with failover across endpoints
//! - Snapshot store with atomic replace
//! - Sync engine (periodic pull or long-poll push)
//! - Change and failure callback dispatch
//! - Cached and direct config services
//! - HTTP transport abstraction
//!
//! ## Architecture
//!
//! `SyncEngine::start` fetches the full configuration synchronously, so the
//! first read after it returns is already valid, then starts one worker
//! thread that keeps the snapshot current:
//! 1. Ask the chooser for a node
//! 2. Fetch (PULLING) or long-poll (LONG_POLLING) that node
//! 3. Publish a newer snapshot and notify change handlers
//!
//! ## Key Invariants
//!
//! - Readers never block on network I/O and never see a partial update
//! - Revisions never go backwards; stale responses are ignored
//! - Transport and handler failures never stop the engine
//! - Credentials are never logged

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod deferred_log;
mod dispatch;
mod error;
mod http;
mod node;
mod service;
mod snapshot;
mod state;
mod transport;

pub use config::{
    parse_duration, parse_server_urls, AppMode, ConnectionContext, ConnectionOptions, RetryConfig,
    DEFAULT_REQUEST_TIMEOUT, MAX_DURATION, MIN_LONG_POLLING_TIMEOUT, MIN_LONG_POLL_PULL_INTERVAL,
};
pub use deferred_log::{DeferredLog, DEFAULT_CAPACITY as DEFERRED_LOG_CAPACITY};
pub use dispatch::{
    CallbackDispatcher, ChangeEvent, ChangeHandler, DispatchReport, FailureHandler,
    HandlerResult, KeyChange,
};
pub use error::{SyncError, SyncResult};
pub use http::{HttpClient, HttpError, HttpTransport, LoopbackClient, LoopbackServer};
pub use node::{Node, NodeChooser, RoundRobinChooser, DEFAULT_FAILURE_THRESHOLD};
pub use service::{CachedConfigService, ConfigService, RemoteConfigService};
pub use snapshot::{Snapshot, SnapshotStore};
pub use state::{SyncEngine, SyncEngineBuilder, SyncState, SyncStats, DEFAULT_STOP_GRACE};
pub use transport::{ConfigTransport, MockCall, MockCallKind, MockTransport};
