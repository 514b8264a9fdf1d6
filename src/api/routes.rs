//! Axum router and handlers.
//!
//! Visitor-facing endpoints (return links, chat) answer failures with
//! [`TRY_AGAIN`] only. Intake and operator endpoints may say more.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{RedeemError, StageError, StoreError, ValidationError};
use crate::stages::{AbandonmentDetector, AbandonmentSignal, LeadSubmitter, SessionRecovery};

/// The only failure text a visitor ever sees.
pub const TRY_AGAIN: &str = "Something went wrong. Please try again.";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub detector: Arc<AbandonmentDetector>,
    pub recovery: Arc<SessionRecovery>,
    pub submitter: Arc<LeadSubmitter>,
}

/// Build the Axum router for the pipeline's HTTP surface.
pub fn pipeline_routes(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/abandonment", post(intake))
        .route("/api/return/{token}", post(redeem))
        .route("/api/chat/{visitor_id}/messages", post(chat_message))
        .route("/api/leads/{id}/resubmit", post(resubmit))
        .layer(cors)
        .with_state(state)
}

fn try_again(status: StatusCode) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(json!({ "error": TRY_AGAIN })))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "lead-pipeline"
    }))
}

// ── Intake ──────────────────────────────────────────────────────────────

async fn intake(
    State(state): State<AppState>,
    Json(signal): Json<AbandonmentSignal>,
) -> impl IntoResponse {
    match state.detector.detect(signal).await {
        Ok(visitor) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "visitor_id": visitor.id,
                "abandonment_step": visitor.abandonment_step,
                "abandoned": visitor.abandoned,
            })),
        ),
        Err(StageError::Validation(e)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        ),
        Err(e) => {
            error!(error = %e, "Abandonment intake failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal error" })),
            )
        }
    }
}

// ── Visitor-facing ──────────────────────────────────────────────────────

async fn redeem(State(state): State<AppState>, Path(token): Path<String>) -> impl IntoResponse {
    match state.recovery.redeem(&token).await {
        Ok(visitor) => (
            StatusCode::OK,
            Json(json!({
                "status": "resumed",
                "visitor_id": visitor.id,
                "abandonment_step": visitor.abandonment_step,
            })),
        ),
        Err(e @ (RedeemError::NotFound | RedeemError::Expired | RedeemError::AlreadyUsed)) => (
            StatusCode::GONE,
            Json(json!({ "error": e.user_message() })),
        ),
        Err(RedeemError::Store(e)) => {
            error!(error = %e, "Token redemption failed");
            try_again(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatMessageRequest {
    text: String,
}

async fn chat_message(
    State(state): State<AppState>,
    Path(visitor_id): Path<String>,
    Json(body): Json<ChatMessageRequest>,
) -> impl IntoResponse {
    let Ok(visitor_id) = Uuid::parse_str(&visitor_id) else {
        return try_again(StatusCode::BAD_REQUEST);
    };

    match state.recovery.handle_message(visitor_id, &body.text).await {
        Ok(outcome) => (StatusCode::OK, Json(json!(outcome))),
        Err(StageError::Store(StoreError::NotFound { .. })) => try_again(StatusCode::NOT_FOUND),
        Err(StageError::Validation(ValidationError::SessionNotResumed(_))) => {
            try_again(StatusCode::FORBIDDEN)
        }
        Err(e) => {
            warn!(visitor_id = %visitor_id, error = %e, "Chat message handling failed");
            try_again(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ── Operator ────────────────────────────────────────────────────────────

async fn resubmit(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let lead_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Invalid lead ID"})),
            );
        }
    };

    info!(lead_id = %lead_id, "Manual resubmission via API");
    match state.submitter.resubmit(lead_id).await {
        Ok(outcome) => (StatusCode::OK, Json(json!(outcome))),
        Err(StageError::Store(StoreError::NotFound { .. })) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Lead not found"})),
        ),
        Err(e) => {
            error!(lead_id = %lead_id, error = %e, "Resubmission errored");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": e.kind() })),
            )
        }
    }
}
