use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// Shared store handle.
///
/// Cloning is cheap (the pool is reference counted); every concurrent task
/// of a run holds its own clone and opens its own short transactions.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection pool and run migrations
    ///
    /// `path` is a filesystem path or `:memory:`.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Locked` if the file is locked by another
    /// process, `DatabaseError::Migration` if the schema could not be created.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: writers wait up to 5 seconds for a competing
        // transaction (another feed's deactivation, for instance) to commit.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self { pool };
        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::Other(e) => DatabaseError::Migration(e.to_string()),
            locked => locked,
        })?;
        tracing::debug!(path = %path, "Database opened");
        Ok(db)
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sections (
                id INTEGER PRIMARY KEY,
                active INTEGER NOT NULL DEFAULT 1,
                external INTEGER NOT NULL DEFAULT 0,
                other INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // section_id is deliberately not a foreign key: feeds pointing at a
        // missing section are treated as section-less by the catalog query.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                active INTEGER NOT NULL DEFAULT 1,
                link TEXT NOT NULL,
                section_id INTEGER
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY,
                external_id INTEGER NOT NULL DEFAULT 0,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                title TEXT NOT NULL DEFAULT '',
                link TEXT NOT NULL DEFAULT '',
                publish_date TEXT NOT NULL DEFAULT '',
                creator TEXT NOT NULL DEFAULT '',
                display_order INTEGER NOT NULL DEFAULT 0,
                subject TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                image_url TEXT NOT NULL DEFAULT '',
                hour TEXT NOT NULL DEFAULT '',
                related TEXT NOT NULL DEFAULT '',
                active INTEGER NOT NULL DEFAULT 1,
                slug TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Exact-match lookup used by reconciliation
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_items_feed_external ON items(feed_id, external_id)",
        )
        .execute(&mut *tx)
        .await?;

        // Retention ordering used by deactivation
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_items_feed_created ON items(feed_id, created_at DESC)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feeds_active ON feeds(active, id)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }
}

#[cfg(test)]
impl Database {
    /// Single-connection in-memory database whose unordered scans come back
    /// in reverse, so a query leaning on implicit rowid order shows it.
    pub(crate) async fn open_with_reversed_scans() -> Self {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .foreign_keys(true)
            .pragma("reverse_unordered_selects", "ON");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        let db = Self { pool };
        db.migrate().await.unwrap();
        db
    }
}
