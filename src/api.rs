//! HTTP API for memrag
//!
//! Thin axum layer over `MemorySystem`. Every handler delegates to one
//! system operation and maps the crate error onto a status code.
//!
//! ## Endpoint Map
//!
//! | Route                                  | Method     | Operation              |
//! |----------------------------------------|------------|------------------------|
//! | `/health`                              | GET        | Health check           |
//! | `/api/v1/memories`                     | POST       | Add one record         |
//! | `/api/v1/memories/batch`               | POST       | Add a batch            |
//! | `/api/v1/memories/:id`                 | GET/DELETE | Fetch or delete        |
//! | `/api/v1/memories/:id/reactivate`      | POST       | Reactivate archived    |
//! | `/api/v1/documents`                    | POST       | Chunk and ingest       |
//! | `/api/v1/documents/:doc_id`            | GET        | Reassembled text       |
//! | `/api/v1/query`                        | POST       | Ranked retrieval       |
//! | `/api/v1/sync`                         | POST       | Sync to cold storage   |
//! | `/api/v1/backup`                       | POST       | Full snapshot          |
//! | `/api/v1/restore`                      | POST       | Restore a partition    |
//! | `/api/v1/lifecycle/sweep`              | POST       | Expire and evict       |
//! | `/api/v1/lifecycle/compact`            | POST       | Purge tombstones       |
//! | `/api/v1/stats`                        | GET        | Counters               |

use crate::error::Error;
use crate::retrieval::QueryRequest;
use crate::system::{MemorySystem, NewRecord};
use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Build the complete HTTP application around one memory system
pub fn build_app(system: Arc<MemorySystem>) -> Router {
    let cors = build_cors(&system.config().api.cors_origins);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/memories", post(add_memory))
        .route("/api/v1/memories/batch", post(add_memories))
        .route("/api/v1/memories/:id", get(get_memory).delete(delete_memory))
        .route("/api/v1/memories/:id/reactivate", post(reactivate_memory))
        .route("/api/v1/documents", post(add_document))
        .route("/api/v1/documents/:doc_id", get(get_document))
        .route("/api/v1/query", post(query))
        .route("/api/v1/sync", post(sync))
        .route("/api/v1/backup", post(backup))
        .route("/api/v1/restore", post(restore))
        .route("/api/v1/lifecycle/sweep", post(sweep))
        .route("/api/v1/lifecycle/compact", post(compact))
        .route("/api/v1/stats", get(stats))
        .with_state(system)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

// =============================================================================
// Errors
// =============================================================================

/// Crate error rendered as `{"error": {"code", "message"}}`
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::Validation(_) | Error::DimensionMismatch { .. } => {
                (StatusCode::BAD_REQUEST, "INVALID_REQUEST")
            }
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Error::EmbeddingUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "EMBEDDING_UNAVAILABLE"),
            Error::SyncDegraded(_) | Error::StorageUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "COLD_STORAGE_UNAVAILABLE")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        (
            status,
            Json(serde_json::json!({"error": {"code": code, "message": self.0.to_string()}})),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn parse_id(id: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(id)
        .map_err(|_| ApiError(Error::Validation(format!("'{}' is not a record id", id))))
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn add_memory(
    State(system): State<Arc<MemorySystem>>,
    Json(request): Json<NewRecord>,
) -> ApiResult<impl IntoResponse> {
    let id = system.add_record_with(request).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

async fn add_memories(
    State(system): State<Arc<MemorySystem>>,
    Json(records): Json<Vec<NewRecord>>,
) -> impl IntoResponse {
    Json(system.add_records(records).await)
}

async fn get_memory(
    State(system): State<Arc<MemorySystem>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    Ok(Json(system.get(&id).await?))
}

async fn delete_memory(
    State(system): State<Arc<MemorySystem>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    system.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reactivate_memory(
    State(system): State<Arc<MemorySystem>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    let new_id = system.reactivate(&id).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": new_id, "restored_from": id })),
    ))
}

#[derive(Deserialize)]
struct AddDocumentRequest {
    doc_id: String,
    text: String,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

async fn add_document(
    State(system): State<Arc<MemorySystem>>,
    Json(request): Json<AddDocumentRequest>,
) -> ApiResult<impl IntoResponse> {
    let report = system
        .add_document(&request.doc_id, &request.text, request.metadata)
        .await?;
    Ok(Json(report))
}

async fn get_document(
    State(system): State<Arc<MemorySystem>>,
    Path(doc_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(system.document(&doc_id).await?))
}

async fn query(
    State(system): State<Arc<MemorySystem>>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(system.query_with(&request).await?))
}

async fn sync(State(system): State<Arc<MemorySystem>>) -> impl IntoResponse {
    Json(system.sync().await)
}

async fn backup(State(system): State<Arc<MemorySystem>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(system.backup_full().await?))
}

#[derive(Deserialize)]
struct RestoreRequest {
    partition: String,
    #[serde(default)]
    snapshot_id: Option<String>,
}

async fn restore(
    State(system): State<Arc<MemorySystem>>,
    Json(request): Json<RestoreRequest>,
) -> ApiResult<impl IntoResponse> {
    let report = match &request.snapshot_id {
        Some(snapshot_id) => system.restore_snapshot(&request.partition, snapshot_id).await?,
        None => system.restore(&request.partition).await?,
    };
    Ok(Json(report))
}

async fn sweep(State(system): State<Arc<MemorySystem>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(system.sweep().await?))
}

async fn compact(State(system): State<Arc<MemorySystem>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(system.compact().await?))
}

async fn stats(State(system): State<Arc<MemorySystem>>) -> impl IntoResponse {
    Json(system.stats().await)
}

// =============================================================================
// CORS
// =============================================================================

fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        cors.allow_origin(parsed)
    }
}
