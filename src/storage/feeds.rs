use async_trait::async_trait;

use super::schema::Database;
use super::types::{Feed, FeedDbRow, FeedId, NewFeed, StoreError, FEED_COLUMNS};

/// Read/write contract the pipeline needs from feed persistence.
///
/// Per-record mutations must be atomic from the store's side; callers add no
/// locking of their own.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Exact-match lookup on the normalized URL.
    async fn by_url(&self, url: &str) -> Result<Option<Feed>, StoreError>;

    async fn by_id(&self, id: FeedId) -> Result<Option<Feed>, StoreError>;

    /// Create a feed record.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateUrl`] if a record for the URL already exists.
    async fn create(&self, feed: &NewFeed) -> Result<FeedId, StoreError>;

    /// Every persisted feed, ordered by id.
    async fn all(&self) -> Result<Vec<Feed>, StoreError>;

    /// Mark a feed invalid with a reason. Re-invalidating replaces the reason.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no feed has the id.
    async fn set_invalid(&self, id: FeedId, reason: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl FeedStore for Database {
    async fn by_url(&self, url: &str) -> Result<Option<Feed>, StoreError> {
        let row: Option<FeedDbRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?"))
                .bind(url)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(FeedDbRow::into_feed))
    }

    async fn by_id(&self, id: FeedId) -> Result<Option<Feed>, StoreError> {
        let row: Option<FeedDbRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(FeedDbRow::into_feed))
    }

    async fn create(&self, feed: &NewFeed) -> Result<FeedId, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO feeds (url, title, author, created_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(&feed.url)
        .bind(&feed.title)
        .bind(&feed.author)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_insert(e, &feed.url))?;

        tracing::debug!(feed_id = id, url = %feed.url, "Feed created");
        Ok(id)
    }

    async fn all(&self) -> Result<Vec<Feed>, StoreError> {
        let rows: Vec<FeedDbRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds ORDER BY id"))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    async fn set_invalid(&self, id: FeedId, reason: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE feeds SET valid = 0, invalid_reason = ? WHERE id = ?")
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

impl Database {
    // ========================================================================
    // Fetch Bookkeeping
    // ========================================================================

    /// Record a successful fetch: store the new conditional-fetch validators,
    /// clear any invalid state and stamp `last_fetched`.
    pub async fn record_fetch(
        &self,
        id: FeedId,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE feeds SET
                etag = ?,
                last_modified = ?,
                last_fetched = ?,
                valid = 1,
                invalid_reason = NULL
            WHERE id = ?
        "#,
        )
        .bind(etag)
        .bind(last_modified)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Record a 304 response: validators are still current, so only the
    /// timestamp moves and the feed counts as reachable again.
    pub async fn record_not_modified(&self, id: FeedId) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE feeds SET last_fetched = ?, valid = 1, invalid_reason = NULL WHERE id = ?",
        )
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}
