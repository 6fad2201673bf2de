//! Stand-ins shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use askdata::completion::{CompletionClient, CompletionRequest, CompletionResponse, Credentials};
use askdata::error::PipelineError;
use askdata::executor::QueryExecutor;
use askdata::models::{Document, GeneratedQuery, QueryResult};
use askdata::pipeline::{Pipeline, PipelineSettings};
use askdata::sanitize::Sanitizer;
use askdata::schema::CollectionSchema;
use askdata::tokenizer::{Tokenizer, TokenizerProvider};

pub fn doc(value: Value) -> Document {
    value.as_object().cloned().expect("document must be an object")
}

pub fn schema() -> CollectionSchema {
    CollectionSchema::financials("financials", "_test")
}

// ─── Completion client ──────────────────────────────────────────────

pub enum Reply {
    Text(String),
    Empty,
    Fail(String),
}

/// Replays canned replies in order and records every request.
#[derive(Default)]
pub struct ScriptedCompletions {
    replies: Mutex<VecDeque<Reply>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletions {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn texts(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Reply::Text(t.to_string())).collect())
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// User message of the n-th request.
    pub fn prompt(&self, n: usize) -> String {
        self.requests.lock().unwrap()[n].messages[1].content.clone()
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletions {
    async fn complete(
        &self,
        request: &CompletionRequest,
        _credentials: &Credentials,
    ) -> Result<CompletionResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Text(text)) => Ok(CompletionResponse::from_text(text)),
            Some(Reply::Empty) => Ok(CompletionResponse::default()),
            Some(Reply::Fail(msg)) => anyhow::bail!(msg),
            None => anyhow::bail!("no scripted reply left"),
        }
    }
}

// ─── Executor ───────────────────────────────────────────────────────

/// Returns a fixed outcome and records the queries it was given.
pub struct RecordingExecutor {
    outcome: Result<Vec<Document>, String>,
    pub seen: Mutex<Vec<GeneratedQuery>>,
}

impl RecordingExecutor {
    pub fn returning(docs: Vec<Document>) -> Self {
        Self {
            outcome: Ok(docs),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(msg: &str) -> Self {
        Self {
            outcome: Err(msg.to_string()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl QueryExecutor for RecordingExecutor {
    async fn execute(&self, query: &GeneratedQuery) -> Result<QueryResult, PipelineError> {
        self.seen.lock().unwrap().push(query.clone());
        match &self.outcome {
            Ok(docs) => Ok(QueryResult::new(docs.clone())),
            Err(msg) => Err(PipelineError::Execution(anyhow::anyhow!(msg.clone()))),
        }
    }
}

// ─── Tokenizer ──────────────────────────────────────────────────────

struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }

    fn context_size(&self) -> usize {
        8192
    }
}

/// Counts acquisitions and releases. `delay` makes each acquisition block
/// the calling thread, like building an encoding does.
#[derive(Default)]
pub struct CountingTokenizers {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub delay: Duration,
}

impl CountingTokenizers {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl TokenizerProvider for CountingTokenizers {
    fn acquire(&self, _model: &str) -> Result<Box<dyn Tokenizer>> {
        std::thread::sleep(self.delay);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(WordTokenizer))
    }

    fn release(&self, _model: &str) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

// ─── Pipeline ───────────────────────────────────────────────────────

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        api_key: Some("sk-test".into()),
        ..PipelineSettings::default()
    }
}

pub fn pipeline(
    completions: Arc<ScriptedCompletions>,
    executor: Arc<dyn QueryExecutor>,
    tokenizers: Arc<CountingTokenizers>,
) -> Pipeline {
    Pipeline::new(
        completions,
        executor,
        tokenizers,
        schema(),
        Sanitizer::new(["db._test", "db.financials", "collection"]),
        settings(),
    )
}
