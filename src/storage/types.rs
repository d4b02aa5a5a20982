use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database file
    #[error("Database is locked by another process")]
    Locked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::Locked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A feed eligible for processing in the current run.
///
/// Snapshot taken once per run by [`Database::active_feeds`](super::Database::active_feeds);
/// the pipeline never writes back to it.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FeedDescriptor {
    pub id: i64,
    pub url: String,
    pub active: bool,
}

/// The normalized, persistable form of one feed item.
///
/// `feed_id` is fixed at creation. Within a feed an item is identified by
/// `external_id` when it is positive, otherwise by a title substring match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalItem {
    pub external_id: i64,
    pub feed_id: i64,
    pub title: String,
    pub description: String,
    pub link: String,
    pub publish_date: String,
    pub content: String,
    pub creator: String,
    pub image_url: String,
    pub category: String,
    pub subject: String,
    pub hour: String,
    pub related: String,
    pub slug: String,
    pub display_order: i64,
    pub active: bool,
}

/// An item row as stored in the `items` table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredItem {
    pub id: i64,
    pub external_id: i64,
    pub feed_id: i64,
    pub title: String,
    pub description: String,
    pub link: String,
    pub publish_date: String,
    pub content: String,
    pub creator: String,
    pub image_url: String,
    pub category: String,
    pub subject: String,
    pub hour: String,
    pub related: String,
    pub slug: String,
    pub display_order: i64,
    pub active: bool,
    pub created_at: i64,
}

/// Outcome of reconciling one item against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "id", rename_all = "snake_case")]
pub enum Reconciled {
    /// A new row was created with this id
    Inserted(i64),
    /// The existing row with this id was overwritten and reactivated
    Updated(i64),
}

impl Reconciled {
    /// Row id of the written item, whichever branch was taken
    pub fn id(&self) -> i64 {
        match self {
            Reconciled::Inserted(id) | Reconciled::Updated(id) => *id,
        }
    }
}

/// Seed data for a section row (used by imports and tests).
#[derive(Debug, Clone, Default)]
pub struct NewSection {
    pub active: bool,
    pub external: bool,
    pub other: bool,
}
