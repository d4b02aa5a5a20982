//! Fetches a catalog of RSS 2.0 feeds concurrently and reconciles their
//! items into a SQLite store.
//!
//! A run loads the eligible feeds ([`storage::Database::active_feeds`]),
//! retires each feed's existing items, fetches and decodes every feed
//! ([`feed::fetch_document`]), normalizes each item ([`feed::normalize_item`])
//! and writes it back by match key ([`storage::Database::reconcile_item`]).
//! [`sync::Pipeline`] drives the whole thing.

pub mod config;
pub mod feed;
pub mod storage;
pub mod sync;
