//! HTTP server exposing the engine and the tree query surface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/summarize` | Run one batch and return its root summary |
//! | `GET`  | `/batches` | All batches, newest first |
//! | `GET`  | `/batches/{id}/status` | Processing status of one batch |
//! | `GET`  | `/batches/{id}/tree` | Nested tree (`?max_depth=&include_content=`) |
//! | `GET`  | `/batches/{id}/nodes` | Flat list of every node |
//! | `GET`  | `/batches/{id}/final` | Root summary with stats and navigation |
//! | `GET`  | `/nodes/{id}/context` | Breadcrumb path and siblings (`?include_siblings=`) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "not found: batch b-1" } }
//! ```
//!
//! Error codes: `bad_request`, `budget_too_small`, `empty_input` (400),
//! `not_found` (404), `cancelled` (408), `conflict` (409),
//! `persistence`, `internal` (500).
//!
//! A batch started by `POST /summarize` runs on its own task, so a client
//! that disconnects does not abandon the batch half-way.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use summary_tree_core::models::ProcessingStatus;

use crate::config::Config;
use crate::engine::{Engine, SummarizeRequest, SummarizeResponse};
use crate::error::EngineError;
use crate::tree::{self, BatchNodes, BatchTree, FinalSummary, NodeContext, TreeOptions};

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

/// Starts the HTTP server on `[server].bind` and runs until the process is
/// terminated.
pub async fn run_server(config: &Config, engine: Arc<Engine>) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(engine);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "server listening");
    println!("sumtree server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// The application router. Exposed so tests and embedding binaries can
/// serve it on their own listener.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/summarize", post(handle_summarize))
        .route("/batches", get(handle_list_batches))
        .route("/batches/{id}/status", get(handle_status))
        .route("/batches/{id}/tree", get(handle_tree))
        .route("/batches/{id}/nodes", get(handle_nodes))
        .route("/batches/{id}/final", get(handle_final))
        .route("/nodes/{id}/context", get(handle_node_context))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { engine })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::InvalidRequest(_)
            | EngineError::BudgetTooSmall { .. }
            | EngineError::EmptyInput => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Cancelled { .. } => StatusCode::REQUEST_TIMEOUT,
            EngineError::BatchExists(_) => StatusCode::CONFLICT,
            EngineError::Persistence { .. } | EngineError::Worker { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
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

// ============ POST /summarize ============

async fn handle_summarize(
    State(state): State<AppState>,
    Json(request): Json<SummarizeRequest>,
) -> Result<Json<SummarizeResponse>, AppError> {
    let engine = state.engine.clone();
    let task = tokio::spawn(async move { engine.summarize(request).await });
    match task.await {
        Ok(result) => Ok(Json(result?)),
        Err(err) => Err(internal(format!("summarize task failed: {}", err))),
    }
}

// ============ Batches ============

#[derive(Serialize)]
struct BatchListResponse {
    batches: Vec<ProcessingStatus>,
}

async fn handle_list_batches(
    State(state): State<AppState>,
) -> Result<Json<BatchListResponse>, AppError> {
    let store = state.engine.store();
    let batches = tree::list_batches(store.as_ref()).await?;
    Ok(Json(BatchListResponse { batches }))
}

async fn handle_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProcessingStatus>, AppError> {
    let store = state.engine.store();
    Ok(Json(tree::batch_status(store.as_ref(), &id).await?))
}

async fn handle_tree(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(options): Query<TreeOptions>,
) -> Result<Json<BatchTree>, AppError> {
    let store = state.engine.store();
    Ok(Json(tree::batch_tree(store.as_ref(), &id, options).await?))
}

async fn handle_nodes(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BatchNodes>, AppError> {
    let store = state.engine.store();
    Ok(Json(tree::read_batch(store.as_ref(), &id).await?))
}

async fn handle_final(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FinalSummary>, AppError> {
    let store = state.engine.store();
    Ok(Json(tree::final_summary(store.as_ref(), &id).await?))
}

// ============ GET /nodes/{id}/context ============

#[derive(Deserialize)]
struct ContextQuery {
    #[serde(default)]
    include_siblings: bool,
}

async fn handle_node_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ContextQuery>,
) -> Result<Json<NodeContext>, AppError> {
    let store = state.engine.store();
    Ok(Json(
        tree::node_context(store.as_ref(), &id, query.include_siblings).await?,
    ))
}
