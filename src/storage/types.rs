use thiserror::Error;

/// Store-assigned feed identifier.
pub type FeedId = i64;

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by the feed store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A create would have produced a second record for an existing URL
    #[error("A feed already exists for URL {0}")]
    DuplicateUrl(String),

    /// No feed with the given id
    #[error("Feed {0} not found")]
    NotFound(FeedId),

    /// Migration failed while opening the store
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Any other storage failure (connection, lock, I/O)
    #[error("Feed store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

impl StoreError {
    /// Map an insert failure, turning a UNIQUE violation on `url` into
    /// [`StoreError::DuplicateUrl`].
    pub(crate) fn from_insert(err: sqlx::Error, url: &str) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return StoreError::DuplicateUrl(url.to_string());
            }
        }
        StoreError::Unavailable(err)
    }
}

// ============================================================================
// Helper Types
// ============================================================================

/// Internal row type for feed queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub valid: bool,
    pub invalid_reason: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_fetched: Option<i64>,
    pub created_at: i64,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            id: self.id,
            url: self.url,
            title: self.title,
            author: self.author,
            valid: self.valid,
            invalid_reason: self.invalid_reason,
            cache: CacheMetadata {
                etag: self.etag,
                last_modified: self.last_modified,
            },
            last_fetched: self.last_fetched,
            created_at: self.created_at,
        }
    }
}

/// Columns selected for every feed read, in [`FeedDbRow`] order.
pub(crate) const FEED_COLUMNS: &str = "id, url, title, author, valid, invalid_reason, \
     etag, last_modified, last_fetched, created_at";

// ============================================================================
// Data Structures
// ============================================================================

/// Conditional-fetch validators remembered from the last successful fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMetadata {
    /// `ETag` response header, replayed as `If-None-Match`
    pub etag: Option<String>,
    /// `Last-Modified` response header, replayed as `If-Modified-Since`
    pub last_modified: Option<String>,
}

impl CacheMetadata {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// A persisted feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feed {
    pub id: FeedId,
    /// Normalized source URL, unique across the store
    pub url: String,
    pub title: Option<String>,
    /// Directory user that owns the feed, when known
    pub author: Option<String>,
    pub valid: bool,
    /// Set only while `valid` is false
    pub invalid_reason: Option<String>,
    pub cache: CacheMetadata,
    /// Unix seconds of the last completed fetch
    pub last_fetched: Option<i64>,
    /// Unix seconds
    pub created_at: i64,
}

/// Data needed to create a feed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFeed {
    pub url: String,
    pub title: Option<String>,
    pub author: Option<String>,
}
