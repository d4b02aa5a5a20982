use serde::Serialize;
use std::fmt;

use super::{DeactivationError, ReconciliationError};
use crate::feed::FeedError;
use crate::storage::FeedDescriptor;

/// Why a feed was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network failure, HTTP status, deadline or body limits
    Fetch,
    /// Body was not a valid RSS 2.0 document
    Format,
    /// The fetch task ended without delivering a result
    Task,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFeed {
    pub feed_id: i64,
    pub url: String,
    pub kind: FailureKind,
    pub reason: String,
}

impl SkippedFeed {
    pub(crate) fn from_error(feed: &FeedDescriptor, error: &FeedError) -> Self {
        let kind = match error {
            FeedError::Fetch(_) => FailureKind::Fetch,
            FeedError::Format(_) => FailureKind::Format,
        };
        Self {
            feed_id: feed.id,
            url: feed.url.clone(),
            kind,
            reason: error.to_string(),
        }
    }

    pub(crate) fn undelivered(feed: &FeedDescriptor) -> Self {
        Self {
            feed_id: feed.id,
            url: feed.url.clone(),
            kind: FailureKind::Task,
            reason: "fetch task ended without a result".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub feed_id: i64,
    pub external_id: i64,
    pub title: String,
    pub reason: String,
}

impl From<&ReconciliationError> for FailedItem {
    fn from(err: &ReconciliationError) -> Self {
        Self {
            feed_id: err.feed_id,
            external_id: err.external_id,
            title: err.title.clone(),
            reason: err.source.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeactivationFailure {
    pub feed_id: i64,
    pub reason: String,
}

impl From<&DeactivationError> for DeactivationFailure {
    fn from(err: &DeactivationError) -> Self {
        Self {
            feed_id: err.feed_id(),
            reason: err.to_string(),
        }
    }
}

/// Outcome of one pipeline run.
///
/// `feeds_skipped` and `items_failed` are listed in the order the failures
/// were observed, which across feeds is arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Feeds taken from the catalog
    pub feeds_attempted: usize,
    /// Feeds whose document was decoded and reconciled
    pub feeds_processed: usize,
    pub feeds_skipped: Vec<SkippedFeed>,
    pub items_inserted: usize,
    pub items_updated: usize,
    pub items_failed: Vec<FailedItem>,
    /// Items whose link was not an absolute URL
    pub link_warnings: usize,
    /// Rows switched to inactive across all feeds
    pub items_deactivated: u64,
    pub deactivation_failures: Vec<DeactivationFailure>,
}

impl RunSummary {
    /// Items inserted or updated
    pub fn items_reconciled(&self) -> usize {
        self.items_inserted + self.items_updated
    }

    /// True when no feed, item or deactivation failed
    pub fn is_clean(&self) -> bool {
        self.feeds_skipped.is_empty()
            && self.items_failed.is_empty()
            && self.deactivation_failures.is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Feeds: {} attempted, {} processed, {} skipped",
            self.feeds_attempted,
            self.feeds_processed,
            self.feeds_skipped.len()
        )?;
        writeln!(
            f,
            "Items: {} reconciled ({} inserted, {} updated), {} failed, {} deactivated",
            self.items_reconciled(),
            self.items_inserted,
            self.items_updated,
            self.items_failed.len(),
            self.items_deactivated
        )?;
        for skipped in &self.feeds_skipped {
            writeln!(
                f,
                "  skipped feed {} ({}): {}",
                skipped.feed_id, skipped.url, skipped.reason
            )?;
        }
        for failure in &self.deactivation_failures {
            writeln!(f, "  deactivation failed: {}", failure.reason)?;
        }
        for item in &self.items_failed {
            writeln!(
                f,
                "  item failed (feed {}, external id {}, {:?}): {}",
                item.feed_id, item.external_id, item.title, item.reason
            )?;
        }
        Ok(())
    }
}
