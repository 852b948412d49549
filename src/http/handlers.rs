use super::state::AppState;
use crate::pipeline::{PipelineError, TurnAudio};
use crate::session::{ScenarioContext, StoreError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub scenario: ScenarioContext,
}

/// One captured turn
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    /// Base64-encoded audio
    pub audio: String,
    /// Container format hint, defaults to the pipeline's `audio_format`
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

fn store_error_response(e: StoreError) -> Response {
    let status = match e {
        StoreError::SessionNotFound(_) | StoreError::MessageNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::SessionEnded(_) | StoreError::FeedbackAlreadyAttached(_) => {
            StatusCode::CONFLICT
        }
    };
    error_response(status, e.to_string())
}

fn pipeline_error_response(session_id: &str, e: PipelineError) -> Response {
    let status = match &e {
        PipelineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::SessionEnded(_) => StatusCode::CONFLICT,
        PipelineError::Store(_) => {
            error!("Request for {} failed: {}", session_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, e.to_string())
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /sessions
/// Create a conversation session for a scenario
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    let session = state.store().create_session(req.scenario).await;
    (StatusCode::CREATED, Json(session)).into_response()
}

/// GET /sessions/:session_id
/// Session with its messages so far
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.store().session(&session_id).await {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(e) => store_error_response(e),
    }
}

/// POST /sessions/:session_id/end
/// End a session; later turns are rejected
pub async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    info!("Ending session {} on request", session_id);

    match state.pipeline.end_session(&session_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => pipeline_error_response(&session_id, e),
    }
}

/// POST /sessions/:session_id/turns
/// Transcribe, answer, synthesize and persist one turn
pub async fn submit_turn(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<TurnRequest>,
) -> impl IntoResponse {
    let bytes = match base64::engine::general_purpose::STANDARD.decode(&req.audio) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        Ok(_) => return error_response(StatusCode::BAD_REQUEST, "Turn audio is empty"),
        Err(e) => {
            warn!("Rejecting turn for {}: bad audio encoding: {}", session_id, e);
            return error_response(StatusCode::BAD_REQUEST, format!("Invalid audio: {}", e));
        }
    };

    let audio = TurnAudio {
        bytes,
        format: req
            .format
            .unwrap_or_else(|| state.pipeline.config().audio_format.clone()),
    };

    match state.pipeline.run_turn(&session_id, audio).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => pipeline_error_response(&session_id, e),
    }
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
