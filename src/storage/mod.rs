//! Feed persistence.
//!
//! [`Database`] wraps a SQLite pool holding the `feeds` table (owned by this
//! module) and the `jobs` table (owned by [`crate::queue`]). The pipeline
//! talks to it only through the [`FeedStore`] trait.

mod feeds;
mod schema;
mod types;

pub use feeds::FeedStore;
pub use schema::Database;
pub use types::{CacheMetadata, Feed, FeedId, NewFeed, StoreError};
