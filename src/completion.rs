//! Chat completion client.
//!
//! [`CompletionClient`] is the seam the pipeline calls; [`OpenAiClient`]
//! talks to an OpenAI-compatible `POST /v1/chat/completions` endpoint.
//! Requests are non-streaming and are never retried: a failed call fails
//! the request.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::models::Message;

/// Body of a chat completion call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stream: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub message: ChoiceMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl CompletionResponse {
    /// A response with a single choice carrying `text`.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            choices: vec![Choice {
                message: ChoiceMessage {
                    content: Some(text.into()),
                },
            }],
        }
    }

    /// Content of the first choice, if there is one and it has content.
    pub fn first_text(self) -> Option<String> {
        self.choices.into_iter().next()?.message.content
    }
}

/// Who the completion call is billed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub organization: Option<String>,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> Result<CompletionResponse>;
}

pub struct OpenAiClient {
    client: reqwest::Client,
    endpoint: String,
}

impl OpenAiClient {
    pub fn new(api_host: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/chat/completions", api_host.trim_end_matches('/')),
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Self::new(&config.api_host, Duration::from_secs(config.timeout_secs))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> Result<CompletionResponse> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", credentials.api_key))
            .header("Content-Type", "application/json");
        if let Some(org) = &credentials.organization {
            builder = builder.header("OpenAI-Organization", org);
        }

        let response = builder
            .json(request)
            .send()
            .await
            .with_context(|| format!("Completion request to {} failed", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        response
            .json::<CompletionResponse>()
            .await
            .context("Failed to decode completion response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_shape() {
        let request = CompletionRequest {
            model: "gpt-4".into(),
            messages: vec![Message::system("sys"), Message::user("hi")],
            max_tokens: 1000,
            temperature: 1.0,
            stream: false,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "model": "gpt-4",
                "messages": [
                    {"role": "system", "content": "sys"},
                    {"role": "user", "content": "hi"}
                ],
                "max_tokens": 1000,
                "temperature": 1.0,
                "stream": false
            })
        );
    }

    #[test]
    fn test_first_text() {
        let response: CompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "first"}},
                {"index": 1, "message": {"role": "assistant", "content": "second"}}
            ]
        }))
        .unwrap();
        assert_eq!(response.first_text().as_deref(), Some("first"));

        let empty: CompletionResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert_eq!(empty.first_text(), None);

        let null_content: CompletionResponse =
            serde_json::from_value(json!({"choices": [{"message": {"content": null}}]})).unwrap();
        assert_eq!(null_content.first_text(), None);
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let client = OpenAiClient::new("http://localhost:1234/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.endpoint(), "http://localhost:1234/v1/chat/completions");
    }
}
