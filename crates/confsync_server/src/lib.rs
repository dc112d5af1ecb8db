//! # confsync Server
//!
//! Reference in-memory configuration authority for confsync clients.
//!
//! This crate provides:
//! - Per-app configuration storage with revisions and change history
//! - Fetch and long-poll handlers
//! - Credential checks (HMAC-SHA256 tags, constant-time comparison)
//! - Path-based dispatch of JSON request bodies
//!
//! It is meant for tests, demos and local development. Authoring is limited
//! to `publish` / `remove` / `publish_all` calls.
//!
//! # Protocol
//!
//! 1. A client fetches the full mapping and its revision
//! 2. It long-polls with that revision
//! 3. The server answers as soon as the app moves past that revision, with
//!    the keys changed since (or the full mapping if history is too short),
//!    or with "unchanged" once the hold expires

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod repository;
mod server;

pub use auth::AppAuthenticator;
pub use config::{ServerConfig, DEFAULT_HISTORY_LIMIT, DEFAULT_MAX_HOLD};
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use repository::{ChangeSet, ConfigRepository};
pub use server::ConfigServer;
