//! # confsync Protocol
//!
//! Wire types for talking to a configuration authority.
//!
//! This crate provides:
//! - `Credentials` (app code + secret key, redacted in `Debug`)
//! - `Revision` markers used to detect server-side changes
//! - Fetch and long-poll request/response messages
//! - JSON encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod messages;

pub use codec::{decode_json, encode_json};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    Credentials, FetchRequest, FetchResponse, LongPollRequest, LongPollResponse, Revision,
    FETCH_PATH, LONG_POLL_PATH,
};
