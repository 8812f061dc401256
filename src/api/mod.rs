//! Capture server API module.
//!
//! Typed REST client and the JSON types it exchanges.

mod client;
mod error;
mod types;

pub use client::{redact_url, ApiClient};
pub use error::ApiError;
pub use types::*;
