use super::schema::Database;
use super::types::{DatabaseError, FeedDescriptor, NewSection};

impl Database {
    // ========================================================================
    // Catalog
    // ========================================================================

    /// Load the feeds eligible for this run, ordered by ascending id.
    ///
    /// A feed is eligible when it is active and either has no owning section
    /// (including a dangling `section_id`) or its section is active, not
    /// externally sourced and not flagged `other`.
    ///
    /// Any error is returned as-is: a partial catalog is never produced.
    pub async fn active_feeds(&self) -> Result<Vec<FeedDescriptor>, DatabaseError> {
        let feeds = sqlx::query_as::<_, FeedDescriptor>(
            r#"
                SELECT f.id, f.link AS url, f.active
                FROM feeds f
                LEFT JOIN sections s ON s.id = f.section_id
                WHERE f.active = 1
                  AND (s.id IS NULL OR (s.active = 1 AND s.external = 0 AND s.other = 0))
                ORDER BY f.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(count = feeds.len(), "Loaded feed catalog");
        Ok(feeds)
    }

    // ========================================================================
    // Catalog Maintenance
    // ========================================================================

    /// Insert a section row, returning its id
    pub async fn insert_section(&self, section: &NewSection) -> Result<i64, DatabaseError> {
        let result = sqlx::query("INSERT INTO sections (active, external, other) VALUES (?, ?, ?)")
            .bind(section.active)
            .bind(section.external)
            .bind(section.other)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Insert a feed row, returning its id
    pub async fn insert_feed(
        &self,
        link: &str,
        active: bool,
        section_id: Option<i64>,
    ) -> Result<i64, DatabaseError> {
        let result = sqlx::query("INSERT INTO feeds (link, active, section_id) VALUES (?, ?, ?)")
            .bind(link)
            .bind(active)
            .bind(section_id)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }
}
