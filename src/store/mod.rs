//! Storage abstraction for the queried collection.
//!
//! The [`DocumentStore`] trait is the only way the executor reaches
//! documents. It evaluates a pushed-down [`Filter`] and returns matching
//! documents in insertion order; everything else a query does happens in
//! process.
//!
//! Implementations must be `Send + Sync` to be shared across handlers.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`scan`](DocumentStore::scan) | Matching documents, in insertion order, up to a limit |
//! | [`insert_documents`](DocumentStore::insert_documents) | Insert or replace documents by `_id` |
//! | [`count`](DocumentStore::count) | Number of stored documents |
//! | [`count_matching`](DocumentStore::count_matching) | Number of documents matching a filter |
//! | [`close`](DocumentStore::close) | Release the underlying resources |

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Document;
use crate::query::Filter;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns documents matching `filter`, at most `limit` of them.
    async fn scan(&self, filter: &Filter, limit: Option<usize>) -> Result<Vec<Document>>;

    /// Inserts documents already normalized against the schema. A document
    /// whose `_id` exists replaces the stored one. Returns the number written.
    async fn insert_documents(&self, docs: &[Document]) -> Result<usize>;

    async fn count(&self) -> Result<u64>;

    /// Counts documents matching `filter` without materializing them.
    async fn count_matching(&self, filter: &Filter) -> Result<u64>;

    /// Closes the store. Later calls fail.
    async fn close(&self);
}
