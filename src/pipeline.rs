//! The question-answering pipeline.
//!
//! ```text
//! ChatRequest ─▶ prompt ─▶ generate ─▶ sanitize ─▶ execute ─▶ summarize ─▶ FinalAnswer
//!                 │          │ LLM                   │ store     │ LLM
//!                 └──────────┴──── tokenizer lease (released on drop) ────┘
//! ```
//!
//! Every step runs once and in order; the first failure ends the request.
//! Nothing is retried.

use std::fmt;
use std::sync::Arc;

use crate::completion::{CompletionClient, CompletionRequest, Credentials, OpenAiClient};
use crate::config::{Config, LlmConfig};
use crate::error::PipelineError;
use crate::executor::{QueryExecutor, StoreExecutor};
use crate::models::{ChatRequest, FinalAnswer, GeneratedQuery, Message, QueryResult};
use crate::prompt::{build_query_prompt, build_summary_prompt, SYSTEM_INSTRUCTION};
use crate::sanitize::Sanitizer;
use crate::schema::CollectionSchema;
use crate::store::DocumentStore;
use crate::tokenizer::{TiktokenProvider, TokenizerLease, TokenizerProvider};

/// How far a request got. Used to label log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Authenticated,
    PromptBuilt,
    QueryGenerated,
    QuerySanitized,
    QueryExecuted,
    SummaryGenerated,
    Responded,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Authenticated => "authenticated",
            PipelineStage::PromptBuilt => "prompt_built",
            PipelineStage::QueryGenerated => "query_generated",
            PipelineStage::QuerySanitized => "query_sanitized",
            PipelineStage::QueryExecuted => "query_executed",
            PipelineStage::SummaryGenerated => "summary_generated",
            PipelineStage::Responded => "responded",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion settings shared by both calls.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub default_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Used when the request carries no key of its own.
    pub api_key: Option<String>,
    pub organization: Option<String>,
}

impl PipelineSettings {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            default_model: config.default_model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            api_key: config.api_key.clone(),
            organization: config.organization.clone(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&LlmConfig::default())
    }
}

pub struct Pipeline {
    completions: Arc<dyn CompletionClient>,
    executor: Arc<dyn QueryExecutor>,
    tokenizers: Arc<dyn TokenizerProvider>,
    schema: CollectionSchema,
    sanitizer: Sanitizer,
    settings: PipelineSettings,
}

fn failed(stage: PipelineStage, err: PipelineError) -> PipelineError {
    tracing::warn!(after = %stage, kind = err.kind(), error = %err, "pipeline failed");
    err
}

impl Pipeline {
    pub fn new(
        completions: Arc<dyn CompletionClient>,
        executor: Arc<dyn QueryExecutor>,
        tokenizers: Arc<dyn TokenizerProvider>,
        schema: CollectionSchema,
        sanitizer: Sanitizer,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            completions,
            executor,
            tokenizers,
            schema,
            sanitizer,
            settings,
        }
    }

    /// Wires the OpenAI client, a store-backed executor and tiktoken, with
    /// the default model's encoding built up front.
    pub fn from_config(config: &Config, store: Arc<dyn DocumentStore>) -> anyhow::Result<Self> {
        let schema = config.collection.schema();
        let executor = StoreExecutor::new(store, schema.clone(), &config.execution);
        let tokenizers = TiktokenProvider::new();
        tokenizers.preload(&[config.llm.default_model.as_str()])?;
        Ok(Self::new(
            Arc::new(OpenAiClient::from_config(&config.llm)?),
            Arc::new(executor),
            Arc::new(tokenizers),
            schema,
            config.collection.sanitizer(),
            PipelineSettings::from_config(&config.llm),
        ))
    }

    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    /// Answers the last message of an authenticated request.
    pub async fn run(&self, request: &ChatRequest) -> Result<FinalAnswer, PipelineError> {
        let question = request
            .last_message()
            .ok_or_else(|| PipelineError::InvalidRequest("messages must not be empty".into()))?;
        let model = request.model_id(&self.settings.default_model);

        let lease = TokenizerLease::load(self.tokenizers.clone(), model)
            .await
            .map_err(|e| failed(PipelineStage::Authenticated, PipelineError::Internal(e)))?;
        let credentials = self
            .credentials(request)
            .map_err(|e| failed(PipelineStage::Authenticated, e))?;

        let prompt = build_query_prompt(&question.content, &self.schema);
        lease.check_prompt("query", &prompt, self.settings.max_tokens);
        tracing::debug!(stage = %PipelineStage::PromptBuilt, model, "prompt built");

        let raw = self
            .generate(model, &credentials, prompt)
            .await
            .map_err(|e| failed(PipelineStage::PromptBuilt, e))?;
        tracing::debug!(stage = %PipelineStage::QueryGenerated, raw = %raw, "query generated");

        let sanitized = self
            .sanitizer
            .sanitize(&raw)
            .map_err(|e| failed(PipelineStage::QueryGenerated, e))?;
        tracing::info!(stage = %PipelineStage::QuerySanitized, query = %sanitized, "generated query");
        let generated = GeneratedQuery { raw, sanitized };

        let result = self
            .executor
            .execute(&generated)
            .await
            .map_err(|e| failed(PipelineStage::QuerySanitized, e))?;
        tracing::info!(stage = %PipelineStage::QueryExecuted, documents = result.len(), "query executed");

        let answer = self
            .summarize(model, &credentials, &result, &lease)
            .await
            .map_err(|e| failed(PipelineStage::QueryExecuted, e))?;
        tracing::debug!(stage = %PipelineStage::SummaryGenerated, "summary generated");

        Ok(FinalAnswer { answer })
    }

    /// Sends the query prompt; returns the model's text untouched.
    pub async fn generate(
        &self,
        model: &str,
        credentials: &Credentials,
        prompt: String,
    ) -> Result<String, PipelineError> {
        self.complete(model, credentials, prompt).await
    }

    /// Renders `result` into the summary prompt and returns the model's
    /// answer verbatim.
    pub async fn summarize(
        &self,
        model: &str,
        credentials: &Credentials,
        result: &QueryResult,
        lease: &TokenizerLease,
    ) -> Result<String, PipelineError> {
        let prompt = build_summary_prompt(result).map_err(PipelineError::Internal)?;
        lease.check_prompt("summary", &prompt, self.settings.max_tokens);
        self.complete(model, credentials, prompt).await
    }

    fn credentials(&self, request: &ChatRequest) -> Result<Credentials, PipelineError> {
        let api_key = request
            .api_key()
            .map(str::to_string)
            .or_else(|| self.settings.api_key.clone())
            .ok_or_else(|| PipelineError::Upstream("no API key configured".into()))?;
        Ok(Credentials {
            api_key,
            organization: self.settings.organization.clone(),
        })
    }

    async fn complete(
        &self,
        model: &str,
        credentials: &Credentials,
        prompt: String,
    ) -> Result<String, PipelineError> {
        let request = CompletionRequest {
            model: model.to_string(),
            messages: vec![Message::system(SYSTEM_INSTRUCTION), Message::user(prompt)],
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            stream: false,
        };
        let response = self
            .completions
            .complete(&request, credentials)
            .await
            .map_err(|e| PipelineError::Upstream(format!("{:#}", e)))?;
        response
            .first_text()
            .ok_or_else(|| PipelineError::Upstream("completion returned no content".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionResponse;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<Vec<CompletionResponse>>,
        seen: Mutex<Vec<(CompletionRequest, Credentials)>>,
    }

    impl Scripted {
        fn new(replies: Vec<CompletionResponse>) -> Self {
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionClient for Scripted {
        async fn complete(
            &self,
            request: &CompletionRequest,
            credentials: &Credentials,
        ) -> anyhow::Result<CompletionResponse> {
            self.seen
                .lock()
                .unwrap()
                .push((request.clone(), credentials.clone()));
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                anyhow::bail!("no scripted reply");
            }
            Ok(replies.remove(0))
        }
    }

    fn pipeline(client: Arc<Scripted>, settings: PipelineSettings) -> Pipeline {
        let schema = CollectionSchema::financials("financials", "_test");
        let executor = StoreExecutor::new(
            Arc::new(InMemoryStore::new()),
            schema.clone(),
            &Default::default(),
        );
        Pipeline::new(
            client,
            Arc::new(executor),
            Arc::new(TiktokenProvider::new()),
            schema,
            Sanitizer::new(["db._test"]),
            settings,
        )
    }

    fn request(key: Option<&str>) -> ChatRequest {
        ChatRequest {
            messages: vec![Message::user("How many rows?")],
            key: key.map(str::to_string),
            model: None,
        }
    }

    #[tokio::test]
    async fn test_request_key_wins_over_configured_key() {
        let client = Arc::new(Scripted::new(vec![
            CompletionResponse::from_text("```db._test.countDocuments()```"),
            CompletionResponse::from_text("There are no rows."),
        ]));
        let settings = PipelineSettings {
            api_key: Some("sk-config".into()),
            organization: Some("org-1".into()),
            ..Default::default()
        };
        let answer = pipeline(client.clone(), settings)
            .run(&request(Some("sk-user")))
            .await
            .unwrap();
        assert_eq!(answer.answer, "There are no rows.");

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1.api_key, "sk-user");
        assert_eq!(seen[0].1.organization.as_deref(), Some("org-1"));
        assert_eq!(seen[0].0.model, "gpt-4");
        assert!(!seen[0].0.stream);
        assert_eq!(seen[0].0.messages[0].content, SYSTEM_INSTRUCTION);
        assert!(seen[1].0.messages[1].content.contains("\"count\": 0"));
    }

    #[tokio::test]
    async fn test_missing_key_is_upstream_error() {
        let client = Arc::new(Scripted::new(vec![]));
        let err = pipeline(client.clone(), PipelineSettings::default())
            .run(&request(Some("")))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Upstream(_)));
        assert!(client.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_choices_is_upstream_error() {
        let client = Arc::new(Scripted::new(vec![CompletionResponse::default()]));
        let err = pipeline(client, PipelineSettings::default())
            .run(&request(Some("sk")))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_no_messages_is_invalid_request() {
        let client = Arc::new(Scripted::new(vec![]));
        let mut req = request(Some("sk"));
        req.messages.clear();
        let err = pipeline(client, PipelineSettings::default())
            .run(&req)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
    }
}
