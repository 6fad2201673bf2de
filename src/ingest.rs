//! Importing documents into the collection.
//!
//! Accepts a JSON array of objects or JSON Lines (one object per line).
//! Every document is normalized against the schema before anything is
//! written, so a bad document aborts the whole load.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::models::Document;
use crate::schema::CollectionSchema;
use crate::store::DocumentStore;

/// Counts reported by [`run_load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadStats {
    pub read: usize,
    pub written: usize,
    pub total: u64,
}

/// Parses a JSON array or JSON Lines text into documents.
pub fn parse_documents(text: &str) -> Result<Vec<Document>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        let values: Vec<Value> =
            serde_json::from_str(trimmed).context("Failed to parse JSON array")?;
        return values
            .into_iter()
            .enumerate()
            .map(|(i, v)| into_document(v, i + 1))
            .collect();
    }

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            let value: Value = serde_json::from_str(line)
                .with_context(|| format!("Failed to parse line {}", i + 1))?;
            into_document(value, i + 1)
        })
        .collect()
}

fn into_document(value: Value, position: usize) -> Result<Document> {
    match value {
        Value::Object(map) => Ok(map),
        other => bail!("entry {} is not an object: {}", position, other),
    }
}

pub fn normalize_all(docs: &[Document], schema: &CollectionSchema) -> Result<Vec<Document>> {
    docs.iter()
        .enumerate()
        .map(|(i, doc)| {
            schema
                .normalize_document(doc)
                .with_context(|| format!("document {} is invalid", i + 1))
        })
        .collect()
}

/// Reads `path`, normalizes every document and inserts them. With
/// `dry_run` nothing is written.
pub async fn run_load(
    store: &dyn DocumentStore,
    schema: &CollectionSchema,
    path: &Path,
    dry_run: bool,
) -> Result<LoadStats> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let docs = normalize_all(&parse_documents(&text)?, schema)?;

    let written = if dry_run {
        0
    } else {
        store.insert_documents(&docs).await?
    };
    let total = store.count().await?;
    tracing::info!(
        file = %path.display(),
        read = docs.len(),
        written,
        total,
        "load finished"
    );

    Ok(LoadStats {
        read: docs.len(),
        written,
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::io::Write;

    #[test]
    fn test_parse_array_and_lines() {
        let docs = parse_documents(r#" [{"channel": "A"}, {"channel": "B"}] "#).unwrap();
        assert_eq!(docs.len(), 2);

        let docs = parse_documents("{\"channel\": \"A\"}\n\n{\"channel\": \"B\"}\n").unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["channel"], "B");

        assert!(parse_documents("[1, 2]").is_err());
        assert!(parse_documents("{\"a\": 1}\nnot json").is_err());
    }

    #[tokio::test]
    async fn test_run_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"[{{"_id": "r1", "channel": "Retail", "aum": 10, "financials_date": "2023-01-31"}},
                {{"_id": "r2", "channel": "Wholesale", "aum": 20.5}}]"#
        )
        .unwrap();

        let store = InMemoryStore::new();
        let schema = CollectionSchema::financials("financials", "_test");

        let stats = run_load(&store, &schema, file.path(), true).await.unwrap();
        assert_eq!((stats.read, stats.written, stats.total), (2, 0, 0));

        let stats = run_load(&store, &schema, file.path(), false).await.unwrap();
        assert_eq!((stats.read, stats.written, stats.total), (2, 2, 2));
    }

    #[tokio::test]
    async fn test_run_load_rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"channel": "Retail", "ssn": "123"}}"#).unwrap();

        let store = InMemoryStore::new();
        let schema = CollectionSchema::financials("financials", "_test");
        let err = run_load(&store, &schema, file.path(), false)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("ssn"));
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
