//! CLI command implementations.

pub mod dump;
pub mod get;
pub mod http_client;
pub mod watch;
