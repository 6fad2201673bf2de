//! Running sanitized queries against the collection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;

use crate::config::ExecutionConfig;
use crate::error::PipelineError;
use crate::models::{Document, GeneratedQuery, QueryResult};
use crate::query::eval::run_stages;
use crate::query::{compile, QueryPlan, Stage};
use crate::schema::CollectionSchema;
use crate::store::DocumentStore;

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &GeneratedQuery) -> Result<QueryResult, PipelineError>;
}

/// Executes queries against a [`DocumentStore`].
///
/// The sanitized text is compiled into a [`QueryPlan`] first; a query that
/// fails to compile never reaches the store. The plan's filter is evaluated
/// by the store and the remaining stages in process, all under
/// `execution.timeout_secs`.
///
/// `max_documents` bounds the rows a query returns. `max_scanned_documents`
/// bounds the rows read from the store to produce them. A leading
/// `countDocuments` is answered by the store without reading rows, and a
/// leading limit is pushed down into the scan.
pub struct StoreExecutor {
    store: Arc<dyn DocumentStore>,
    schema: CollectionSchema,
    timeout: Duration,
    max_documents: usize,
    max_scanned_documents: usize,
}

impl StoreExecutor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        schema: CollectionSchema,
        config: &ExecutionConfig,
    ) -> Self {
        Self {
            store,
            schema,
            timeout: Duration::from_secs(config.timeout_secs),
            max_documents: config.max_documents,
            max_scanned_documents: config.max_scanned_documents.max(config.max_documents),
        }
    }

    pub async fn run_plan(&self, plan: &QueryPlan) -> Result<QueryResult, PipelineError> {
        let documents = match plan.stages.split_first() {
            Some((Stage::Count(name), rest)) => {
                let n = self
                    .store
                    .count_matching(&plan.filter)
                    .await
                    .map_err(PipelineError::Execution)?;
                let mut counted = Document::new();
                counted.insert(name.clone(), Value::from(n));
                run_stages(vec![counted], rest)
            }
            _ => run_stages(self.scan(plan).await?, &plan.stages),
        };
        if documents.len() > self.max_documents {
            return Err(PipelineError::Execution(anyhow!(
                "query returned more than {} documents",
                self.max_documents
            )));
        }
        Ok(QueryResult::new(documents))
    }

    async fn scan(&self, plan: &QueryPlan) -> Result<Vec<Document>, PipelineError> {
        let ceiling = self.max_scanned_documents.saturating_add(1);
        let limit = scan_limit(&plan.stages).map_or(ceiling, |n| n.min(ceiling));
        let scanned = self
            .store
            .scan(&plan.filter, Some(limit))
            .await
            .map_err(PipelineError::Execution)?;
        if scanned.len() > self.max_scanned_documents {
            return Err(PipelineError::Execution(anyhow!(
                "query scanned more than {} documents",
                self.max_scanned_documents
            )));
        }
        tracing::debug!(scanned = scanned.len(), stages = plan.stages.len(), "evaluating stages");
        Ok(scanned)
    }
}

/// Rows the leading stages can consume, when that is known before any
/// stage reorders, filters or groups them. Scans return insertion order, so
/// reading only this many rows gives the same result.
fn scan_limit(stages: &[Stage]) -> Option<usize> {
    let mut skipped = 0usize;
    for stage in stages {
        match stage {
            Stage::Skip(n) => skipped = skipped.saturating_add(*n),
            Stage::Limit(n) => return Some(skipped.saturating_add(*n)),
            Stage::Project(_) => {}
            _ => return None,
        }
    }
    None
}

#[async_trait]
impl QueryExecutor for StoreExecutor {
    async fn execute(&self, query: &GeneratedQuery) -> Result<QueryResult, PipelineError> {
        let plan = compile(&query.sanitized, &self.schema)?;
        match tokio::time::timeout(self.timeout, self.run_plan(&plan)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Execution(anyhow!(
                "query timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}
