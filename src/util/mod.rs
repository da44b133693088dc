//! Utility functions shared by the directory client and the worker.
//!
//! - **Source URLs**: normalization of directory-supplied feed URLs into
//!   the store's dedup key
//! - **HTTP bodies**: size-capped response reads

mod http;
mod source_url;

pub use http::{read_limited_bytes, BodyError};
pub use source_url::{normalize_source_url, SourceUrlError};

/// Maximum response body accepted from the directory service (5MB)
pub const MAX_DIRECTORY_RESPONSE: usize = 5 * 1024 * 1024;

/// Maximum feed body read by the worker (10MB)
pub const MAX_FEED_SIZE: usize = 10 * 1024 * 1024;
