//! Pipeline error taxonomy.
//!
//! Every stage of the question-answering pipeline fails into one
//! [`PipelineError`] variant. The HTTP layer maps variants onto status codes;
//! see [`PipelineError::status_code`].

use axum::http::StatusCode;
use thiserror::Error;

use crate::query::QueryError;

/// Failure of a single question-answering request.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The session gate rejected the caller. No resources were acquired.
    #[error("unauthorized")]
    Unauthorized,

    /// The request body is malformed or has no messages.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The model's reply did not contain a fenced code block.
    #[error("unexpected model output format: {0}")]
    Format(String),

    /// A completion call failed or returned no usable choice.
    #[error("completion API error: {0}")]
    Upstream(String),

    /// The generated query is not expressible in the permitted grammar.
    #[error("query rejected: {0}")]
    Rejected(#[from] QueryError),

    /// The store or the in-process evaluation failed while running the query.
    #[error("query execution failed: {0:#}")]
    Execution(anyhow::Error),

    /// Any other internal failure (tokenizer, serialization).
    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

impl PipelineError {
    /// HTTP status code reported to the caller for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::Unauthorized => StatusCode::UNAUTHORIZED,
            PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Coarse message shown to callers when error detail is not exposed.
    pub fn opaque_message(&self) -> String {
        match self {
            PipelineError::Unauthorized => "Unauthorized".to_string(),
            PipelineError::InvalidRequest(msg) => msg.clone(),
            PipelineError::Format(_) => "Unexpected model output format".to_string(),
            _ => "Error".to_string(),
        }
    }

    /// Short machine-readable label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Unauthorized => "auth",
            PipelineError::InvalidRequest(_) => "invalid_request",
            PipelineError::Format(_) => "format",
            PipelineError::Upstream(_) => "upstream",
            PipelineError::Rejected(_) => "rejected",
            PipelineError::Execution(_) => "execution",
            PipelineError::Internal(_) => "internal",
        }
    }
}
