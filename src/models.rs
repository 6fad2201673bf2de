//! Core data models used throughout askdata.
//!
//! These types represent the chat request, the intermediate values handed
//! between pipeline stages, and the final answer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single document of the collection.
pub type Document = Map<String, Value>;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message, as sent by the client and to the completion API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Model selection sent by the chat client.
///
/// Only `id` is used; the client's other display fields are kept so they
/// round-trip untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRef {
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body of `POST /api/query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub model: Option<ModelRef>,
}

impl ChatRequest {
    /// The message the pipeline answers: always the last one.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Model id to use, falling back to `default` when the client sent none.
    pub fn model_id<'a>(&'a self, default: &'a str) -> &'a str {
        self.model
            .as_ref()
            .map(|m| m.id.as_str())
            .filter(|id| !id.is_empty())
            .unwrap_or(default)
    }

    /// Caller-supplied API key; an empty string counts as absent.
    pub fn api_key(&self) -> Option<&str> {
        self.key.as_deref().filter(|k| !k.is_empty())
    }
}

/// Output of the query generation stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedQuery {
    /// Model text exactly as returned by the completion API.
    pub raw: String,
    /// Fenced expression with collection references replaced by the placeholder.
    pub sanitized: String,
}

/// Documents produced by executing a query, in emission order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct QueryResult {
    pub documents: Vec<Document>,
}

impl QueryResult {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// The markdown answer returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub answer: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_without_model_or_key() {
        let req: ChatRequest = serde_json::from_str(
            r#"{"messages":[{"role":"user","content":"total sales by channel"}]}"#,
        )
        .unwrap();
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.model_id("gpt-4"), "gpt-4");
        assert_eq!(req.api_key(), None);
    }

    #[test]
    fn test_request_with_model_extra_fields() {
        let req: ChatRequest = serde_json::from_str(
            r#"{
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "assistant", "content": "ok"},
                    {"role": "user", "content": "aum by platform"}
                ],
                "key": "",
                "model": {"id": "gpt-4o", "name": "GPT-4o", "tokenLimit": 8000}
            }"#,
        )
        .unwrap();
        assert_eq!(req.model_id("gpt-4"), "gpt-4o");
        assert_eq!(req.last_message().unwrap().content, "aum by platform");
        assert_eq!(req.api_key(), None);
        assert_eq!(req.model.unwrap().extra["tokenLimit"], 8000);
    }

    #[test]
    fn test_unknown_role_rejected() {
        let res: Result<ChatRequest, _> =
            serde_json::from_str(r#"{"messages":[{"role":"tool","content":"x"}]}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_query_result_serializes_as_array() {
        let mut doc = Document::new();
        doc.insert("channel".into(), Value::from("A"));
        let result = QueryResult::new(vec![doc]);
        assert_eq!(
            serde_json::to_string(&result).unwrap(),
            r#"[{"channel":"A"}]"#
        );
    }
}
