//! In-memory [`DocumentStore`] for tests and one-off runs.
//!
//! Documents live in a `Vec` behind `std::sync::RwLock`; filters are
//! evaluated with [`Filter::matches`].

use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::DocumentStore;
use crate::models::Document;
use crate::query::Filter;
use crate::schema::ID_FIELD;

pub struct InMemoryStore {
    docs: RwLock<Vec<Document>>,
    closed: RwLock<bool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(Vec::new()),
            closed: RwLock::new(false),
        }
    }

    /// A store pre-filled with `docs`, kept exactly as given.
    pub fn with_documents(docs: Vec<Document>) -> Self {
        Self {
            docs: RwLock::new(docs),
            closed: RwLock::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if *self.closed.read().map_err(|_| anyhow!("store lock poisoned"))? {
            bail!("store is closed");
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn scan(&self, filter: &Filter, limit: Option<usize>) -> Result<Vec<Document>> {
        self.check_open()?;
        let docs = self.docs.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(docs
            .iter()
            .filter(|d| filter.matches(d))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn insert_documents(&self, new_docs: &[Document]) -> Result<usize> {
        self.check_open()?;
        let mut docs = self.docs.write().map_err(|_| anyhow!("store lock poisoned"))?;
        for doc in new_docs {
            let id = doc.get(ID_FIELD).and_then(Value::as_str);
            let existing = id.and_then(|id| {
                docs.iter()
                    .position(|d| d.get(ID_FIELD).and_then(Value::as_str) == Some(id))
            });
            match existing {
                Some(i) => docs[i] = doc.clone(),
                None => docs.push(doc.clone()),
            }
        }
        Ok(new_docs.len())
    }

    async fn count(&self) -> Result<u64> {
        self.check_open()?;
        let docs = self.docs.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(docs.len() as u64)
    }

    async fn count_matching(&self, filter: &Filter) -> Result<u64> {
        self.check_open()?;
        let docs = self.docs.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(docs.iter().filter(|d| filter.matches(d)).count() as u64)
    }

    async fn close(&self) {
        if let Ok(mut closed) = self.closed.write() {
            *closed = true;
        }
    }
}
