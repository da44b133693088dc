use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::StoreError;

// ============================================================================
// Database
// ============================================================================

/// SQLite-backed store shared by the feed store and the durable job queue.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `path` may be `:memory:` for an isolated in-process database.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the database cannot be opened and
    /// `StoreError::Migration` if the schema cannot be applied.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout lets the worker pool and the cycle controller contend
        // for the single SQLite writer without surfacing SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)?.pragma("busy_timeout", "5000");

        // A shared-cache in-memory database uses table locks that ignore
        // busy_timeout and vanishes with its last connection, so it gets a
        // single connection that is never reaped.
        let in_memory = path == ":memory:";
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate()
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        tracing::debug!(path = %path, "Database opened");
        Ok(db)
    }

    /// Run schema migrations atomically within a transaction.
    ///
    /// Every statement uses `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                url TEXT UNIQUE NOT NULL,
                title TEXT,
                author TEXT,
                valid INTEGER NOT NULL DEFAULT 1,
                invalid_reason TEXT,
                etag TEXT,
                last_modified TEXT,
                last_fetched INTEGER,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Durable job queue. Completed jobs are deleted; each feed keeps at
        // most its latest failure, with `applied` set once the feed has been
        // marked invalid for it.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending'
                    CHECK (state IN ('pending', 'active', 'failed')),
                attempts INTEGER NOT NULL DEFAULT 0,
                reason TEXT,
                applied INTEGER NOT NULL DEFAULT 0,
                enqueued_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("ALTER TABLE jobs ADD COLUMN applied INTEGER NOT NULL DEFAULT 0")
            .execute(&mut *tx)
            .await
            .ok(); // Ignore error if column already exists

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_feed_state ON jobs(feed_id, state)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_creates_tables() {
        let db = Database::open(":memory:").await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();

        assert!(names.contains(&"feeds"));
        assert!(names.contains(&"jobs"));
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = Database::open(":memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();
    }
}
