//! REST API server for the report pipeline
//!
//! Exposes run creation and polling over HTTP. Runs execute in the
//! background; the triggering request returns the pending run at once.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::documents::InMemoryDocumentSource;
use crate::error::PipelineError;
use crate::models::{RunQuery, RunStatus, RunView};
use crate::pipeline::Pipeline;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RegisterDocumentRequest {
    pub owner_id: Option<String>,
    pub filename: String,
    pub document_type: Option<String>,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalysisRequest {
    pub owner_id: Option<String>,
    #[serde(default)]
    pub document_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub owner_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub owner_id: Option<String>,
    pub status: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn reply<T: Serialize>(status: StatusCode, data: T) -> ApiResult {
    (status, Json(ApiResponse::success(data)))
}

fn reject(status: StatusCode, message: impl Into<String>) -> ApiResult {
    (status, Json(ApiResponse::error(message.into())))
}

fn pipeline_failure(e: PipelineError) -> ApiResult {
    match e {
        PipelineError::RunNotFound(_) => reject(StatusCode::NOT_FOUND, "Analysis not found"),
        other => {
            warn!("Request failed: {}", other);
            reject(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<Pipeline>,
    pub documents: Arc<InMemoryDocumentSource>,
}

/// =============================
/// Helpers: Owner Identity
/// =============================

fn stable_uuid_from_string(input: &str) -> Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}

/// Opaque owner ids map onto a stable UUID
pub fn parse_or_stable_uuid(value: Option<&str>, fallback_seed: &str) -> Uuid {
    match value {
        Some(v) if !v.trim().is_empty() => {
            Uuid::parse_str(v).unwrap_or_else(|_| stable_uuid_from_string(v))
        }
        _ => stable_uuid_from_string(fallback_seed),
    }
}

fn owner_from(value: Option<&str>) -> Uuid {
    parse_or_stable_uuid(value, "anonymous-user")
}

fn parse_run_id(raw: &str) -> Result<Uuid, ApiResult> {
    Uuid::parse_str(raw)
        .map_err(|_| reject(StatusCode::BAD_REQUEST, format!("Invalid analysis id: {}", raw)))
}

/// Load a run and check it belongs to the caller
async fn owned_run(state: &ApiState, raw_id: &str, owner_id: Uuid) -> Result<RunView, ApiResult> {
    let run_id = parse_run_id(raw_id)?;
    let view = state
        .pipeline
        .get_run(run_id)
        .await
        .map_err(pipeline_failure)?;

    if view.owner_id != owner_id {
        return Err(reject(StatusCode::FORBIDDEN, "Access denied"));
    }

    Ok(view)
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Documents
/// =============================

async fn register_document(
    State(state): State<ApiState>,
    Json(req): Json<RegisterDocumentRequest>,
) -> ApiResult {
    if req.filename.trim().is_empty() {
        return reject(StatusCode::BAD_REQUEST, "filename must not be empty");
    }
    if req.text.trim().is_empty() {
        return reject(StatusCode::BAD_REQUEST, "text must not be empty");
    }

    let owner_id = owner_from(req.owner_id.as_deref());
    let record = state
        .documents
        .register_text(owner_id, req.filename, req.document_type, req.text)
        .await;

    info!(document_id = %record.document_id, owner_id = %owner_id, "Document registered");

    reply(StatusCode::CREATED, record)
}

/// =============================
/// Analysis Endpoints
/// =============================

async fn start_analysis(
    State(state): State<ApiState>,
    Json(req): Json<AnalysisRequest>,
) -> ApiResult {
    let owner_id = owner_from(req.owner_id.as_deref());

    match state.pipeline.start_run(owner_id, req.document_ids).await {
        Ok(started) => {
            info!(run_id = %started.run.run_id, "Analysis accepted");
            // The supervisor owns the run from here on
            drop(started.handle);
            reply(
                StatusCode::ACCEPTED,
                serde_json::json!({
                    "analysis_id": started.run.run_id,
                    "status": started.run.status,
                    "message": "Analysis started successfully",
                    "estimated_completion": chrono::Utc::now() + chrono::Duration::minutes(5),
                    "created_at": started.run.created_at,
                    "completed_at": started.run.completed_at,
                    "report": null,
                    "error": null,
                }),
            )
        }
        Err(e) => pipeline_failure(e),
    }
}

async fn list_analyses(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let owner_id = owner_from(query.owner_id.as_deref());

    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => match RunStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return reject(StatusCode::BAD_REQUEST, format!("Unknown status: {}", raw));
            }
        },
    };

    let defaults = RunQuery::default();
    let run_query = RunQuery {
        status,
        page: query.page.unwrap_or(defaults.page),
        limit: query.limit.unwrap_or(defaults.limit),
    };

    match state.pipeline.list_runs(owner_id, &run_query).await {
        Ok(page) => reply(StatusCode::OK, page),
        Err(e) => pipeline_failure(e),
    }
}

async fn get_analysis(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult {
    let owner_id = owner_from(query.owner_id.as_deref());

    match owned_run(&state, &id, owner_id).await {
        Ok(view) => reply(StatusCode::OK, view),
        Err(rejection) => rejection,
    }
}

async fn get_analysis_stages(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult {
    let owner_id = owner_from(query.owner_id.as_deref());

    let view = match owned_run(&state, &id, owner_id).await {
        Ok(view) => view,
        Err(rejection) => return rejection,
    };

    match state.pipeline.stage_results(view.run_id).await {
        Ok(stages) => reply(StatusCode::OK, stages),
        Err(e) => pipeline_failure(e),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/documents", post(register_document))
        .route("/api/analysis", get(list_analyses))
        .route("/api/analysis/run", post(start_analysis))
        .route("/api/analysis/:id", get(get_analysis))
        .route("/api/analysis/:id/stages", get(get_analysis_stages))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    host: &str,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port)).await?;

    info!("API Server listening on http://{}:{}", host, port);

    axum::serve(listener, router).await?;

    Ok(())
}
