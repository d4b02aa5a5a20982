use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Row, Sqlite};

use super::schema::Database;
use super::types::{CanonicalItem, DatabaseError, Reconciled, StoredItem};

/// Columns written on both insert and update, in bind order (see [`bind_item`])
const ITEM_ASSIGNMENTS: &str = "external_id = ?, feed_id = ?, title = ?, link = ?, \
     publish_date = ?, creator = ?, display_order = ?, subject = ?, category = ?, \
     description = ?, content = ?, image_url = ?, hour = ?, related = ?, active = ?, slug = ?";

const ITEM_SELECT: &str = "SELECT id, external_id, feed_id, title, description, link, \
     publish_date, content, creator, image_url, category, subject, hour, related, slug, \
     display_order, active, created_at FROM items";

/// How an incoming item is matched to an existing row of its feed.
#[derive(Debug, Clone, Copy)]
enum MatchKey<'a> {
    /// Exact `(feed_id, external_id)` match
    External(i64),
    /// Stored title contains the candidate title (SQL `LIKE '%title%'`).
    /// Several rows may qualify; the lowest id wins.
    Title(&'a str),
}

impl<'a> MatchKey<'a> {
    fn for_item(item: &'a CanonicalItem) -> Self {
        if item.external_id > 0 {
            MatchKey::External(item.external_id)
        } else {
            MatchKey::Title(&item.title)
        }
    }

    /// Subquery selecting the matched row id; binds `feed_id` then the key
    fn subquery(&self) -> &'static str {
        match self {
            MatchKey::External(_) => {
                "SELECT id FROM items WHERE feed_id = ? AND external_id = ? ORDER BY id LIMIT 1"
            }
            MatchKey::Title(_) => {
                "SELECT id FROM items WHERE feed_id = ? AND title LIKE '%' || ? || '%' \
                 ORDER BY id LIMIT 1"
            }
        }
    }

    fn bind<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
        feed_id: i64,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>>
    where
        'a: 'q,
    {
        let query = query.bind(feed_id);
        match *self {
            MatchKey::External(external_id) => query.bind(external_id),
            MatchKey::Title(title) => query.bind(title),
        }
    }
}

/// Bind every mutable item column in [`ITEM_ASSIGNMENTS`] order
fn bind_item<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    item: &'q CanonicalItem,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(item.external_id)
        .bind(item.feed_id)
        .bind(item.title.as_str())
        .bind(item.link.as_str())
        .bind(item.publish_date.as_str())
        .bind(item.creator.as_str())
        .bind(item.display_order)
        .bind(item.subject.as_str())
        .bind(item.category.as_str())
        .bind(item.description.as_str())
        .bind(item.content.as_str())
        .bind(item.image_url.as_str())
        .bind(item.hour.as_str())
        .bind(item.related.as_str())
        .bind(item.active)
        .bind(item.slug.as_str())
}

impl Database {
    // ========================================================================
    // Deactivation
    // ========================================================================

    /// Mark a feed's stored items inactive, returning how many rows changed.
    ///
    /// The `keep_recent` most recently created items are left untouched; with
    /// `keep_recent = 0` every item of the feed ends up inactive. Items of
    /// other feeds are never touched. Runs in its own transaction.
    pub async fn deactivate_feed_items(
        &self,
        feed_id: i64,
        keep_recent: u32,
    ) -> Result<u64, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE items SET active = 0
            WHERE feed_id = ?
              AND active = 1
              AND id NOT IN (
                  SELECT id FROM items
                  WHERE feed_id = ?
                  ORDER BY created_at DESC, id DESC
                  LIMIT ?
              )
        "#,
        )
        .bind(feed_id)
        .bind(feed_id)
        .bind(i64::from(keep_recent))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            feed_id = feed_id,
            deactivated = result.rows_affected(),
            "Feed items deactivated"
        );
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Insert a new item or overwrite (and reactivate) its existing row.
    ///
    /// Matching: exact `(feed_id, external_id)` when `external_id > 0`,
    /// otherwise the first row of the feed whose title contains the item's
    /// title. Lookup and write share one transaction, and the write is issued
    /// first so the transaction holds the write lock from its first
    /// statement. Nothing is committed if either statement fails.
    pub async fn reconcile_item(&self, item: &CanonicalItem) -> Result<Reconciled, DatabaseError> {
        let key = MatchKey::for_item(item);
        let mut tx = self.pool.begin().await?;

        let update_sql = format!(
            "UPDATE items SET {} WHERE id = ({}) RETURNING id",
            ITEM_ASSIGNMENTS,
            key.subquery()
        );
        let updated = key
            .bind(bind_item(sqlx::query(&update_sql), item), item.feed_id)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match updated {
            Some(row) => Reconciled::Updated(row.try_get("id")?),
            None => {
                let now = chrono::Utc::now().timestamp();
                let row = bind_item(
                    sqlx::query(
                        r#"
                        INSERT INTO items (external_id, feed_id, title, link, publish_date,
                            creator, display_order, subject, category, description, content,
                            image_url, hour, related, active, slug, created_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                        RETURNING id
                    "#,
                    ),
                    item,
                )
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
                Reconciled::Inserted(row.try_get("id")?)
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    // ========================================================================
    // Item Queries
    // ========================================================================

    /// Fetch one stored item by id
    pub async fn get_item(&self, item_id: i64) -> Result<Option<StoredItem>, DatabaseError> {
        let item = sqlx::query_as::<_, StoredItem>(&format!("{} WHERE id = ?", ITEM_SELECT))
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    /// All stored items of a feed, ordered by id
    pub async fn items_for_feed(&self, feed_id: i64) -> Result<Vec<StoredItem>, DatabaseError> {
        let sql = format!("{} WHERE feed_id = ? ORDER BY id", ITEM_SELECT);
        let items = sqlx::query_as::<_, StoredItem>(&sql)
            .bind(feed_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{CanonicalItem, Database, Reconciled, StoredItem};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    /// Create a feed row with a fixed id so items can reference it
    async fn seed_feed(db: &Database, id: i64) {
        sqlx::query("INSERT INTO feeds (id, link, active) VALUES (?, ?, 1)")
            .bind(id)
            .bind(format!("https://feed{}.example.com/rss", id))
            .execute(&db.pool)
            .await
            .unwrap();
    }

    async fn stored(db: &Database, id: i64) -> StoredItem {
        db.get_item(id).await.unwrap().expect("item should exist")
    }

    fn test_item(feed_id: i64, external_id: i64, title: &str) -> CanonicalItem {
        CanonicalItem {
            external_id,
            feed_id,
            title: title.to_string(),
            description: "Description".to_string(),
            link: format!("https://example.com/{}", external_id),
            content: "Content".to_string(),
            slug: external_id.to_string(),
            active: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reconcile_inserts_new_item() {
        let db = test_db().await;
        seed_feed(&db, 5).await;

        let outcome = db.reconcile_item(&test_item(5, 7, "Hello")).await.unwrap();
        let Reconciled::Inserted(id) = outcome else {
            panic!("Expected insert, got {:?}", outcome);
        };

        let row = stored(&db, id).await;
        assert_eq!(row.external_id, 7);
        assert_eq!(row.feed_id, 5);
        assert_eq!(row.title, "Hello");
        assert!(row.active);
        assert!(row.created_at > 0);
    }

    #[tokio::test]
    async fn test_reconcile_same_external_id_twice_updates() {
        let db = test_db().await;
        seed_feed(&db, 5).await;

        let first = db
            .reconcile_item(&test_item(5, 7, "Original"))
            .await
            .unwrap();
        let second = db
            .reconcile_item(&test_item(5, 7, "Revised"))
            .await
            .unwrap();

        assert!(matches!(first, Reconciled::Inserted(_)));
        assert_eq!(second, Reconciled::Updated(first.id()));

        let items = db.items_for_feed(5).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Revised");
    }

    #[tokio::test]
    async fn test_reconcile_external_id_scoped_to_feed() {
        let db = test_db().await;
        seed_feed(&db, 5).await;
        seed_feed(&db, 6).await;

        let a = db.reconcile_item(&test_item(5, 7, "Same")).await.unwrap();
        let b = db.reconcile_item(&test_item(6, 7, "Same")).await.unwrap();

        assert!(matches!(a, Reconciled::Inserted(_)));
        assert!(matches!(b, Reconciled::Inserted(_)));
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_reconcile_title_substring_fallback_updates() {
        let db = test_db().await;
        seed_feed(&db, 5).await;

        let existing = db
            .reconcile_item(&test_item(5, 0, "Test Match"))
            .await
            .unwrap();

        let outcome = db.reconcile_item(&test_item(5, 0, "Test")).await.unwrap();
        assert_eq!(outcome, Reconciled::Updated(existing.id()));

        let items = db.items_for_feed(5).await.unwrap();
        assert_eq!(items.len(), 1);
        // The matched row takes the incoming title
        assert_eq!(items[0].title, "Test");
    }

    #[tokio::test]
    async fn test_reconcile_title_fallback_first_match_wins() {
        let db = test_db().await;
        seed_feed(&db, 5).await;

        let first = db
            .reconcile_item(&test_item(5, 11, "Breaking news today"))
            .await
            .unwrap();
        db.reconcile_item(&test_item(5, 12, "More breaking news"))
            .await
            .unwrap();

        let outcome = db
            .reconcile_item(&test_item(5, 0, "news"))
            .await
            .unwrap();
        assert_eq!(outcome, Reconciled::Updated(first.id()));
    }

    #[tokio::test]
    async fn test_reconcile_title_fallback_no_match_inserts() {
        let db = test_db().await;
        seed_feed(&db, 5).await;
        seed_feed(&db, 6).await;

        // Same title in another feed must not match
        db.reconcile_item(&test_item(6, 0, "Breaking")).await.unwrap();

        let outcome = db
            .reconcile_item(&test_item(5, 0, "Breaking"))
            .await
            .unwrap();
        assert!(matches!(outcome, Reconciled::Inserted(_)));
    }

    #[tokio::test]
    async fn test_reconcile_reactivates_matched_row() {
        let db = test_db().await;
        seed_feed(&db, 5).await;

        let id = db
            .reconcile_item(&test_item(5, 7, "Item"))
            .await
            .unwrap()
            .id();
        db.deactivate_feed_items(5, 0).await.unwrap();
        assert!(!stored(&db, id).await.active);

        db.reconcile_item(&test_item(5, 7, "Item")).await.unwrap();
        assert!(stored(&db, id).await.active);
    }

    #[tokio::test]
    async fn test_reconcile_failure_rolls_back() {
        let db = test_db().await;

        // Feed 42 does not exist: the foreign key rejects the insert
        let result = db.reconcile_item(&test_item(42, 1, "Orphan")).await;
        assert!(result.is_err());
        assert!(db.items_for_feed(42).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_preserves_created_at_on_update() {
        let db = test_db().await;
        seed_feed(&db, 5).await;

        let id = db
            .reconcile_item(&test_item(5, 7, "Item"))
            .await
            .unwrap()
            .id();
        sqlx::query("UPDATE items SET created_at = 1000 WHERE id = ?")
            .bind(id)
            .execute(&db.pool)
            .await
            .unwrap();

        db.reconcile_item(&test_item(5, 7, "Item")).await.unwrap();
        assert_eq!(stored(&db, id).await.created_at, 1000);
    }

    #[tokio::test]
    async fn test_deactivate_only_touches_feed() {
        let db = test_db().await;
        seed_feed(&db, 5).await;
        seed_feed(&db, 6).await;

        for n in 1..=3 {
            db.reconcile_item(&test_item(5, n, "five")).await.unwrap();
        }
        db.reconcile_item(&test_item(6, 1, "six")).await.unwrap();

        let count = db.deactivate_feed_items(5, 0).await.unwrap();
        assert_eq!(count, 3);

        assert!(db.items_for_feed(5).await.unwrap().iter().all(|i| !i.active));
        assert!(db.items_for_feed(6).await.unwrap().iter().all(|i| i.active));
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let db = test_db().await;
        seed_feed(&db, 5).await;
        db.reconcile_item(&test_item(5, 1, "one")).await.unwrap();

        assert_eq!(db.deactivate_feed_items(5, 0).await.unwrap(), 1);
        assert_eq!(db.deactivate_feed_items(5, 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deactivate_empty_feed() {
        let db = test_db().await;
        seed_feed(&db, 5).await;
        assert_eq!(db.deactivate_feed_items(5, 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deactivate_keeps_most_recent() {
        let db = test_db().await;
        seed_feed(&db, 5).await;

        let mut ids = Vec::new();
        for n in 1..=4 {
            let id = db
                .reconcile_item(&test_item(5, n, "item"))
                .await
                .unwrap()
                .id();
            sqlx::query("UPDATE items SET created_at = ? WHERE id = ?")
                .bind(1000 + n)
                .bind(id)
                .execute(&db.pool)
                .await
                .unwrap();
            ids.push(id);
        }

        let count = db.deactivate_feed_items(5, 2).await.unwrap();
        assert_eq!(count, 2);

        let items = db.items_for_feed(5).await.unwrap();
        let active: Vec<i64> = items.iter().filter(|i| i.active).map(|i| i.id).collect();
        assert_eq!(active, vec![ids[2], ids[3]]);
    }
}
