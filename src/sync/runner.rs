use futures::FutureExt;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use super::summary::{DeactivationFailure, FailedItem, RunSummary, SkippedFeed};
use super::{DeactivationError, ReconciliationError, SyncError};
use crate::feed::{
    fetch_document, normalize_item, FeedError, FetchOptions, Normalized, RawDocument,
};
use crate::storage::{Database, DatabaseError, FeedDescriptor, Reconciled};

/// When a feed's old items are retired relative to reconciling its new ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationMode {
    /// The drain loop waits for a feed's deactivation before reconciling it,
    /// so freshly reconciled items always end up active.
    #[default]
    Sequenced,
    /// Deactivation and reconciliation of the same feed race; an item
    /// reconciled before the deactivation lands may be switched off again.
    Concurrent,
}

/// Knobs for one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Upper bound on feeds fetched at once
    pub concurrency: usize,
    pub fetch: FetchOptions,
    pub deactivation_mode: DeactivationMode,
    /// Newest items per feed left untouched by deactivation (0 retires all)
    pub keep_recent: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            fetch: FetchOptions::default(),
            deactivation_mode: DeactivationMode::default(),
            keep_recent: 0,
        }
    }
}

/// Result of one fetch task, delivered to the drain loop
enum FeedOutcome {
    Fetched {
        feed: FeedDescriptor,
        document: RawDocument,
    },
    Failed {
        feed: FeedDescriptor,
        error: FeedError,
    },
    Panicked {
        feed: FeedDescriptor,
        message: String,
    },
}

impl FeedOutcome {
    fn feed(&self) -> &FeedDescriptor {
        match self {
            FeedOutcome::Fetched { feed, .. }
            | FeedOutcome::Failed { feed, .. }
            | FeedOutcome::Panicked { feed, .. } => feed,
        }
    }
}

type DeactivationHandle = JoinHandle<Result<u64, DatabaseError>>;

/// Shared context of a run: the store, the HTTP client and the options.
///
/// Cloning is cheap; the pool and the client are reference counted.
#[derive(Clone)]
pub struct Pipeline {
    db: Database,
    client: reqwest::Client,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(db: Database, client: reqwest::Client, options: PipelineOptions) -> Self {
        Self {
            db,
            client,
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run the pipeline once over every eligible feed.
    ///
    /// Only a catalog failure is fatal. Everything else is logged, counted in
    /// the returned [`RunSummary`] and the run carries on.
    pub async fn run(&self) -> Result<RunSummary, SyncError> {
        tracing::info!(phase = "loading", "Loading feed catalog");
        let feeds = self.db.active_feeds().await.map_err(|e| {
            tracing::error!(error = %e, "Feed catalog could not be loaded, aborting run");
            SyncError::Catalog(e)
        })?;

        Ok(self.process(feeds).await)
    }

    /// Fetch, deactivate and reconcile the given feeds.
    ///
    /// Each feed gets its own fetch task (at most `concurrency` in flight) and
    /// its own deactivation task. Fetch results are drained one at a time in
    /// arrival order, so all item writes happen on this task.
    ///
    /// Repeated feed ids are processed once, at their first position.
    pub async fn process(&self, feeds: Vec<FeedDescriptor>) -> RunSummary {
        let feeds = dedup_feeds(feeds);
        let mut summary = RunSummary {
            feeds_attempted: feeds.len(),
            ..Default::default()
        };

        if feeds.is_empty() {
            tracing::info!(phase = "done", "No eligible feeds");
            return summary;
        }

        tracing::info!(
            phase = "fetching",
            feeds = feeds.len(),
            concurrency = self.options.concurrency,
            mode = ?self.options.deactivation_mode,
            "Starting feed sync"
        );

        let capacity = self.options.concurrency.max(1);
        let permits = Arc::new(Semaphore::new(capacity));
        let (tx, mut rx) = mpsc::channel::<FeedOutcome>(capacity);

        let mut deactivations: HashMap<i64, DeactivationHandle> =
            HashMap::with_capacity(feeds.len());
        let mut undelivered: HashMap<i64, FeedDescriptor> = HashMap::with_capacity(feeds.len());

        for feed in feeds {
            deactivations.insert(feed.id, self.spawn_deactivation(feed.id));
            self.spawn_fetch(feed.clone(), Arc::clone(&permits), tx.clone());
            undelivered.insert(feed.id, feed);
        }
        // The drain loop below only ends once every task has dropped its sender
        drop(tx);

        tracing::info!(phase = "draining", "Waiting for fetch results");
        while !undelivered.is_empty() {
            let Some(outcome) = rx.recv().await else {
                break;
            };
            undelivered.remove(&outcome.feed().id);

            match outcome {
                FeedOutcome::Fetched { feed, document } => {
                    if self.options.deactivation_mode == DeactivationMode::Sequenced {
                        if let Some(handle) = deactivations.remove(&feed.id) {
                            settle_deactivation(feed.id, handle, &mut summary).await;
                        }
                    }
                    self.reconcile_document(&feed, &document, &mut summary).await;
                    summary.feeds_processed += 1;
                }
                FeedOutcome::Failed { feed, error } => {
                    tracing::warn!(
                        feed_id = feed.id,
                        url = %feed.url,
                        error = %error,
                        "Feed skipped"
                    );
                    summary.feeds_skipped.push(SkippedFeed::from_error(&feed, &error));
                }
                FeedOutcome::Panicked { feed, message } => {
                    tracing::error!(
                        feed_id = feed.id,
                        url = %feed.url,
                        error = %message,
                        "Fetch task panicked"
                    );
                    let mut skipped = SkippedFeed::undelivered(&feed);
                    skipped.reason = format!("fetch task panicked: {}", message);
                    summary.feeds_skipped.push(skipped);
                }
            }
        }

        let mut missing: Vec<FeedDescriptor> = undelivered.into_values().collect();
        missing.sort_by_key(|feed| feed.id);
        for feed in missing {
            tracing::error!(feed_id = feed.id, "Fetch task ended without a result");
            summary.feeds_skipped.push(SkippedFeed::undelivered(&feed));
        }

        // Deactivations of failed feeds, and all of them in concurrent mode
        let mut remaining: Vec<(i64, DeactivationHandle)> = deactivations.into_iter().collect();
        remaining.sort_by_key(|(feed_id, _)| *feed_id);
        for (feed_id, handle) in remaining {
            settle_deactivation(feed_id, handle, &mut summary).await;
        }

        tracing::info!(
            phase = "done",
            attempted = summary.feeds_attempted,
            processed = summary.feeds_processed,
            skipped = summary.feeds_skipped.len(),
            inserted = summary.items_inserted,
            updated = summary.items_updated,
            failed = summary.items_failed.len(),
            deactivated = summary.items_deactivated,
            "Feed sync complete"
        );
        summary
    }

    fn spawn_deactivation(&self, feed_id: i64) -> DeactivationHandle {
        let db = self.db.clone();
        let keep_recent = self.options.keep_recent;
        tokio::spawn(async move { db.deactivate_feed_items(feed_id, keep_recent).await })
    }

    /// Spawn the fetch task of one feed.
    ///
    /// The permit is held until the outcome has been handed to the drain
    /// loop, which bounds the number of decoded documents held in memory.
    fn spawn_fetch(
        &self,
        feed: FeedDescriptor,
        permits: Arc<Semaphore>,
        tx: mpsc::Sender<FeedOutcome>,
    ) {
        let client = self.client.clone();
        let options = self.options.fetch.clone();

        tokio::spawn(async move {
            // The semaphore is never closed, so acquisition cannot fail
            let _permit = permits.acquire_owned().await.ok();

            tracing::debug!(feed_id = feed.id, url = %feed.url, "Fetching feed");
            let result = AssertUnwindSafe(fetch_document(&client, &feed.url, &options))
                .catch_unwind()
                .await;

            let outcome = match result {
                Ok(Ok(document)) => FeedOutcome::Fetched { feed, document },
                Ok(Err(error)) => FeedOutcome::Failed { feed, error },
                Err(panic) => FeedOutcome::Panicked {
                    feed,
                    message: panic_message(panic.as_ref()),
                },
            };

            if let Err(e) = tx.send(outcome).await {
                tracing::warn!(
                    feed_id = e.0.feed().id,
                    "Channel send failed (receiver dropped)"
                );
            }
        });
    }

    /// Normalize and reconcile every item of a document, in document order.
    async fn reconcile_document(
        &self,
        feed: &FeedDescriptor,
        document: &RawDocument,
        summary: &mut RunSummary,
    ) {
        tracing::debug!(
            feed_id = feed.id,
            items = document.items.len(),
            "Reconciling feed items"
        );

        for raw in &document.items {
            let Normalized { item, link_error } = normalize_item(feed.id, raw);

            if let Some(e) = link_error {
                tracing::warn!(
                    feed_id = feed.id,
                    link = %item.link,
                    error = %e,
                    "Item link is not an absolute URL, slug taken from raw text"
                );
                summary.link_warnings += 1;
            }

            match self.db.reconcile_item(&item).await {
                Ok(Reconciled::Inserted(id)) => {
                    tracing::trace!(feed_id = feed.id, item_id = id, "Item inserted");
                    summary.items_inserted += 1;
                }
                Ok(Reconciled::Updated(id)) => {
                    tracing::trace!(feed_id = feed.id, item_id = id, "Item updated");
                    summary.items_updated += 1;
                }
                Err(source) => {
                    let err = ReconciliationError::new(&item, source);
                    tracing::warn!(error = %err, "Item skipped");
                    summary.items_failed.push(FailedItem::from(&err));
                }
            }
        }
    }
}

fn dedup_feeds(mut feeds: Vec<FeedDescriptor>) -> Vec<FeedDescriptor> {
    let mut seen = HashSet::with_capacity(feeds.len());
    feeds.retain(|feed| {
        let first = seen.insert(feed.id);
        if !first {
            tracing::warn!(feed_id = feed.id, url = %feed.url, "Duplicate feed ignored");
        }
        first
    });
    feeds
}

/// Await a deactivation task and fold its outcome into the summary
async fn settle_deactivation(feed_id: i64, handle: DeactivationHandle, summary: &mut RunSummary) {
    let err = match handle.await {
        Ok(Ok(rows)) => {
            summary.items_deactivated += rows;
            return;
        }
        Ok(Err(source)) => DeactivationError::Database { feed_id, source },
        Err(source) => DeactivationError::Task { feed_id, source },
    };

    tracing::warn!(error = %err, "Deactivation failed");
    summary.deactivation_failures.push(DeactivationFailure::from(&err));
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewSection;
    use crate::sync::FailureKind;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ONE_ITEM: &str = "<item><id>1</id><title>A</title></item>";
    const ATOM_FEED: &str = r#"<feed xmlns="http://www.w3.org/2005/Atom"></feed>"#;

    fn rss(items: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>T</title>{}</channel></rss>"#,
            items
        )
    }

    async fn mount(server: &MockServer, route: &str, template: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(template)
            .mount(server)
            .await;
    }

    fn pipeline(db: &Database, mode: DeactivationMode) -> Pipeline {
        Pipeline::new(
            db.clone(),
            reqwest::Client::new(),
            PipelineOptions {
                concurrency: 4,
                fetch: FetchOptions {
                    timeout: Some(Duration::from_secs(5)),
                    ..FetchOptions::default()
                },
                deactivation_mode: mode,
                keep_recent: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_empty_catalog_yields_empty_summary() {
        let db = Database::open(":memory:").await.unwrap();

        let summary = pipeline(&db, DeactivationMode::Sequenced)
            .run()
            .await
            .unwrap();
        assert_eq!(summary, RunSummary::default());
    }

    #[tokio::test]
    async fn test_catalog_failure_is_fatal() {
        let db = Database::open(":memory:").await.unwrap();
        db.close().await;

        let result = pipeline(&db, DeactivationMode::Sequenced).run().await;
        assert!(matches!(result, Err(SyncError::Catalog(_))));
    }

    #[tokio::test]
    async fn test_refresh_updates_known_item_and_inserts_new_one() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/news",
            ResponseTemplate::new(200).set_body_string(rss(
                r#"<item>
                     <id>7</id><title>Updated title</title><link>http://example.com/a/seven</link>
                   </item>
                   <item><title>Breaking</title><link>http://example.com/b</link></item>"#,
            )),
        )
        .await;

        let db = Database::open(":memory:").await.unwrap();
        let feed_id = db
            .insert_feed(&format!("{}/news", server.uri()), true, None)
            .await
            .unwrap();
        let existing = db
            .reconcile_item(&crate::storage::CanonicalItem {
                external_id: 7,
                feed_id,
                title: "Old title".to_string(),
                active: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let summary = pipeline(&db, DeactivationMode::Sequenced)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.feeds_processed, 1);
        assert_eq!(summary.items_updated, 1);
        assert_eq!(summary.items_inserted, 1);
        assert!(summary.is_clean());

        let items = db.items_for_feed(feed_id).await.unwrap();
        assert_eq!(items.len(), 2);
        let seven = items.iter().find(|i| i.external_id == 7).unwrap();
        assert_eq!(seven.id, existing.id());
        assert_eq!(seven.title, "Updated title");
        assert_eq!(seven.slug, "a/seven");
        assert!(seven.active);
        let breaking = items.iter().find(|i| i.title == "Breaking").unwrap();
        assert!(breaking.active);
    }

    #[tokio::test]
    async fn test_items_missing_from_feed_are_retired() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/news",
            ResponseTemplate::new(200)
                .set_body_string(rss("<item><id>1</id><title>Still here</title></item>")),
        )
        .await;

        let db = Database::open(":memory:").await.unwrap();
        let feed_id = db
            .insert_feed(&format!("{}/news", server.uri()), true, None)
            .await
            .unwrap();
        for (external_id, title) in [(1, "Still here"), (2, "Gone")] {
            db.reconcile_item(&crate::storage::CanonicalItem {
                external_id,
                feed_id,
                title: title.to_string(),
                active: true,
                ..Default::default()
            })
            .await
            .unwrap();
        }

        let summary = pipeline(&db, DeactivationMode::Sequenced)
            .run()
            .await
            .unwrap();
        assert_eq!(summary.items_deactivated, 2);

        let items = db.items_for_feed(feed_id).await.unwrap();
        let active: Vec<i64> = items.iter().filter(|i| i.active).map(|i| i.external_id).collect();
        assert_eq!(active, vec![1]);
    }

    #[tokio::test]
    async fn test_failed_feeds_are_skipped_others_processed() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/ok",
            ResponseTemplate::new(200).set_body_string(rss(ONE_ITEM)),
        )
        .await;
        mount(&server, "/down", ResponseTemplate::new(503)).await;
        mount(
            &server,
            "/atom",
            ResponseTemplate::new(200).set_body_string(ATOM_FEED),
        )
        .await;

        let db = Database::open(":memory:").await.unwrap();
        let ok = db
            .insert_feed(&format!("{}/ok", server.uri()), true, None)
            .await
            .unwrap();
        let down = db
            .insert_feed(&format!("{}/down", server.uri()), true, None)
            .await
            .unwrap();
        let atom = db
            .insert_feed(&format!("{}/atom", server.uri()), true, None)
            .await
            .unwrap();

        let summary = pipeline(&db, DeactivationMode::Sequenced)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.feeds_attempted, 3);
        assert_eq!(summary.feeds_processed, 1);
        assert_eq!(summary.items_inserted, 1);

        let mut skipped: Vec<(i64, FailureKind)> = summary
            .feeds_skipped
            .iter()
            .map(|s| (s.feed_id, s.kind))
            .collect();
        skipped.sort_by_key(|(id, _)| *id);
        assert_eq!(skipped, vec![(down, FailureKind::Fetch), (atom, FailureKind::Format)]);

        assert_eq!(db.items_for_feed(ok).await.unwrap().len(), 1);
        assert!(db.items_for_feed(down).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ineligible_feeds_not_fetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss("")))
            .expect(1)
            .mount(&server)
            .await;

        let db = Database::open(":memory:").await.unwrap();
        let external = db
            .insert_section(&NewSection {
                active: true,
                external: true,
                other: false,
            })
            .await
            .unwrap();
        db.insert_feed(&format!("{}/a", server.uri()), true, None)
            .await
            .unwrap();
        db.insert_feed(&format!("{}/b", server.uri()), false, None)
            .await
            .unwrap();
        db.insert_feed(&format!("{}/c", server.uri()), true, Some(external))
            .await
            .unwrap();

        let summary = pipeline(&db, DeactivationMode::Sequenced)
            .run()
            .await
            .unwrap();
        assert_eq!(summary.feeds_attempted, 1);
        assert_eq!(summary.feeds_processed, 1);
    }

    #[tokio::test]
    async fn test_single_permit_processes_every_feed() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/feed",
            ResponseTemplate::new(200).set_body_string(rss(ONE_ITEM)),
        )
        .await;

        let db = Database::open(":memory:").await.unwrap();
        for _ in 0..5 {
            db.insert_feed(&format!("{}/feed", server.uri()), true, None)
                .await
                .unwrap();
        }

        let mut options = pipeline(&db, DeactivationMode::Sequenced).options().clone();
        options.concurrency = 1;
        let summary = Pipeline::new(db.clone(), reqwest::Client::new(), options)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.feeds_processed, 5);
        assert_eq!(summary.items_inserted, 5);
    }

    #[tokio::test]
    async fn test_concurrent_mode_joins_all_deactivations() {
        let server = MockServer::start().await;
        mount(&server, "/down", ResponseTemplate::new(500)).await;

        let db = Database::open(":memory:").await.unwrap();
        let feed_id = db
            .insert_feed(&format!("{}/down", server.uri()), true, None)
            .await
            .unwrap();
        db.reconcile_item(&crate::storage::CanonicalItem {
            external_id: 3,
            feed_id,
            title: "Old".to_string(),
            active: true,
            ..Default::default()
        })
        .await
        .unwrap();

        let summary = pipeline(&db, DeactivationMode::Concurrent)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.feeds_skipped.len(), 1);
        assert_eq!(summary.items_deactivated, 1);
        assert!(!db.items_for_feed(feed_id).await.unwrap()[0].active);
    }

    #[tokio::test]
    async fn test_store_failures_are_recorded_and_run_continues() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/news",
            ResponseTemplate::new(200).set_body_string(rss(
                r#"<item><id>1</id><title>Kept</title></item>
                   <item><id>2</id><title>Rejected</title></item>
                   <item><id>3</id><title>After</title></item>"#,
            )),
        )
        .await;

        let db = Database::open(":memory:").await.unwrap();
        let feed_id = db
            .insert_feed(&format!("{}/news", server.uri()), true, None)
            .await
            .unwrap();
        db.reconcile_item(&crate::storage::CanonicalItem {
            external_id: 1,
            feed_id,
            title: "Kept".to_string(),
            active: true,
            ..Default::default()
        })
        .await
        .unwrap();

        sqlx::query(
            r#"
            CREATE TRIGGER refuse_deactivation BEFORE UPDATE OF active ON items
            WHEN NEW.active = 0
            BEGIN SELECT RAISE(ABORT, 'deactivation refused'); END
        "#,
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
            CREATE TRIGGER reject_item BEFORE INSERT ON items
            WHEN NEW.external_id = 2
            BEGIN SELECT RAISE(ABORT, 'bad item'); END
        "#,
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let summary = pipeline(&db, DeactivationMode::Sequenced)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.deactivation_failures.len(), 1);
        assert_eq!(summary.deactivation_failures[0].feed_id, feed_id);
        assert!(summary.deactivation_failures[0].reason.contains("deactivation refused"));
        assert_eq!(summary.items_deactivated, 0);

        // The feed is still reconciled; only the rejected item is lost
        assert_eq!(summary.feeds_processed, 1);
        assert_eq!(summary.items_updated, 1);
        assert_eq!(summary.items_inserted, 1);
        assert_eq!(summary.items_failed.len(), 1);
        assert_eq!(summary.items_failed[0].feed_id, feed_id);
        assert_eq!(summary.items_failed[0].external_id, 2);
        assert_eq!(summary.items_failed[0].title, "Rejected");
        assert!(summary.items_failed[0].reason.contains("bad item"));

        let stored: Vec<i64> = db
            .items_for_feed(feed_id)
            .await
            .unwrap()
            .iter()
            .map(|i| i.external_id)
            .collect();
        assert_eq!(stored, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_duplicate_feed_ids_processed_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/news"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(rss(ONE_ITEM)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let db = Database::open(":memory:").await.unwrap();
        let url = format!("{}/news", server.uri());
        let id = db.insert_feed(&url, true, None).await.unwrap();
        let feed = FeedDescriptor {
            id,
            url,
            active: true,
        };

        let summary = pipeline(&db, DeactivationMode::Sequenced)
            .process(vec![feed.clone(), feed])
            .await;

        assert_eq!(summary.feeds_attempted, 1);
        assert_eq!(summary.feeds_processed, 1);
        assert_eq!(summary.items_inserted, 1);
        assert!(summary.is_clean());
    }

    #[test]
    fn test_deactivation_mode_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: DeactivationMode,
        }
        let parsed: Wrapper = toml::from_str("mode = \"concurrent\"").unwrap();
        assert_eq!(parsed.mode, DeactivationMode::Concurrent);
        assert_eq!(DeactivationMode::default(), DeactivationMode::Sequenced);
    }
}
