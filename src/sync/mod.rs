//! The fetch → normalize → reconcile pipeline.
//!
//! Failures are graded by blast radius:
//!
//! - [`SyncError`] aborts the run before any feed is touched
//! - [`FeedError`](crate::feed::FeedError) skips one feed
//! - [`DeactivationError`] is recorded, the feed is still reconciled
//! - [`ReconciliationError`] skips one item
//!
//! Everything below the run level ends up in the [`RunSummary`].

mod runner;
mod summary;

pub use runner::{DeactivationMode, Pipeline, PipelineOptions};
pub use summary::{DeactivationFailure, FailedItem, FailureKind, RunSummary, SkippedFeed};

use crate::storage::{CanonicalItem, DatabaseError};
use thiserror::Error;

/// Errors that end the run.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The feed catalog could not be read; nothing was fetched
    #[error("Failed to load feed catalog: {0}")]
    Catalog(#[source] DatabaseError),
}

/// A feed's existing items could not be retired.
#[derive(Debug, Error)]
pub enum DeactivationError {
    #[error("Failed to deactivate items of feed {feed_id}: {source}")]
    Database {
        feed_id: i64,
        #[source]
        source: DatabaseError,
    },
    /// The deactivation task panicked or was cancelled
    #[error("Deactivation task for feed {feed_id} did not complete: {source}")]
    Task {
        feed_id: i64,
        #[source]
        source: tokio::task::JoinError,
    },
}

impl DeactivationError {
    pub fn feed_id(&self) -> i64 {
        match self {
            DeactivationError::Database { feed_id, .. }
            | DeactivationError::Task { feed_id, .. } => *feed_id,
        }
    }
}

/// One item could not be written.
#[derive(Debug, Error)]
#[error("Failed to reconcile item {external_id} {title:?} of feed {feed_id}: {source}")]
pub struct ReconciliationError {
    pub feed_id: i64,
    pub external_id: i64,
    pub title: String,
    #[source]
    pub source: DatabaseError,
}

impl ReconciliationError {
    pub(crate) fn new(item: &CanonicalItem, source: DatabaseError) -> Self {
        Self {
            feed_id: item.feed_id,
            external_id: item.external_id,
            title: item.title.clone(),
            source,
        }
    }
}
