//! Feed retrieval and decoding.
//!
//! - [`fetcher`] - single-GET HTTP retrieval with a deadline and body limits
//! - [`parser`] - RSS 2.0 decoding into [`RawDocument`]/[`RawItem`]
//! - [`normalize`] - mapping of a [`RawItem`] onto the persisted item shape
//!
//! # Example
//!
//! ```ignore
//! use feedsync::feed::{fetch_document, normalize_item, FetchOptions};
//!
//! let doc = fetch_document(&client, &feed.url, &FetchOptions::default()).await?;
//! for raw in &doc.items {
//!     let normalized = normalize_item(feed.id, raw);
//!     db.reconcile_item(&normalized.item).await?;
//! }
//! ```

mod fetcher;
mod normalize;
mod parser;

pub use fetcher::{
    build_client, fetch_document, FeedError, FetchError, FetchOptions, DEFAULT_MAX_DOCUMENT_BYTES,
};
pub use normalize::{normalize_item, Normalized};
pub use parser::{parse_document, Enclosure, FormatError, RawDocument, RawItem, RSS_VERSION};
