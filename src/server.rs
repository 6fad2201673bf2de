//! HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/query` | Answer the last message of a [`ChatRequest`] |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error contract
//!
//! Failures are `{"error": "<message>"}` with status 400, 401 or 500. Unless
//! `server.expose_error_detail` is set the message is coarse:
//! `"Unauthorized"`, `"Unexpected model output format"` or `"Error"`. The
//! full error is always logged.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::{gate_from_config, SessionGate};
use crate::config::Config;
use crate::error::PipelineError;
use crate::models::ChatRequest;
use crate::pipeline::{Pipeline, PipelineStage};
use crate::store::{DocumentStore, SqliteStore};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
    gate: Arc<dyn SessionGate>,
    expose_error_detail: bool,
}

impl AppState {
    pub fn new(
        pipeline: Arc<Pipeline>,
        gate: Arc<dyn SessionGate>,
        expose_error_detail: bool,
    ) -> Self {
        Self {
            pipeline,
            gate,
            expose_error_detail,
        }
    }

    fn error(&self, err: PipelineError) -> AppError {
        match &err {
            PipelineError::Unauthorized => tracing::warn!("rejected unauthenticated request"),
            PipelineError::InvalidRequest(_) => tracing::warn!(error = %err, "invalid request"),
            _ => tracing::error!(kind = err.kind(), error = %err, "request failed"),
        }
        AppError {
            status: err.status_code(),
            message: if self.expose_error_detail && !matches!(err, PipelineError::Unauthorized) {
                err.to_string()
            } else {
                err.opaque_message()
            },
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/query", post(handle_query))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Serves on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Opens the store, binds `[server].bind` and serves until Ctrl-C. The
/// store is closed after the last request finishes.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::connect(config).await?);
    let pipeline = Arc::new(Pipeline::from_config(config, store.clone())?);
    let state = AppState::new(
        pipeline,
        gate_from_config(&config.auth),
        config.server.expose_error_detail,
    );

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!(
        addr = %config.server.bind,
        auth = config.auth.is_enabled(),
        "askdata listening"
    );

    let result = serve(listener, state, shutdown_signal()).await;
    store.close().await;
    tracing::info!("store closed");
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/query ============

/// Handler for `POST /api/query`.
///
/// The session gate runs before the body is even parsed; an
/// unauthenticated caller gets 401 and the pipeline is never entered.
async fn handle_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.gate.is_authenticated(&headers).await {
        return state.error(PipelineError::Unauthorized).into_response();
    }
    tracing::debug!(stage = %PipelineStage::Authenticated, "request accepted");

    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return state
                .error(PipelineError::InvalidRequest(format!("invalid request body: {}", e)))
                .into_response()
        }
    };

    match state.pipeline.run(&request).await {
        Ok(answer) => {
            tracing::info!(stage = %PipelineStage::Responded, "answered");
            (StatusCode::OK, Json(answer)).into_response()
        }
        Err(err) => state.error(err).into_response(),
    }
}
