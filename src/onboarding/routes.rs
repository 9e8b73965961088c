//! REST endpoints for the onboarding queue and stage workflow.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::server::{ApiError, context_from_headers};

use super::engine::OnboardingEngine;
use super::model::{IntakeData, StageSubmission, TaskUpdate};

/// Shared state for onboarding routes.
#[derive(Clone)]
pub struct OnboardingRouteState {
    pub engine: Arc<OnboardingEngine>,
}

#[derive(Debug, Deserialize)]
struct CreateRecordRequest {
    intake: IntakeData,
    #[serde(default)]
    assigned_user_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AssignOwnerRequest {
    user_id: i64,
}

/// GET /api/onboarding/queue
async fn list_queue(
    State(state): State<OnboardingRouteState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.list_queue().await?))
}

/// GET /api/onboarding/stats
async fn queue_stats(
    State(state): State<OnboardingRouteState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.queue_stats().await?))
}

/// POST /api/onboarding
///
/// Registers a referral and returns its id; stage 1 is already complete.
async fn create_record(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    Json(body): Json<CreateRecordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    let id = state
        .engine
        .create_record(&ctx, &body.intake, body.assigned_user_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "onboarding_id": id })),
    ))
}

/// GET /api/onboarding/{id}
async fn details(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.details(id).await?))
}

/// POST /api/onboarding/{id}/stages/{stage}/advance
async fn advance_stage(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    Path((id, stage)): Path<(i64, u8)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    let changed = state.engine.advance_stage(&ctx, id, stage).await?;
    Ok(Json(serde_json::json!({ "changed": changed })))
}

/// POST /api/onboarding/{id}/submit
async fn complete_stage(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<StageSubmission>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    let current = state.engine.complete_stage(&ctx, id, &body).await?;
    Ok(Json(serde_json::json!({
        "current_stage": current,
        "label": current.label(),
    })))
}

/// POST /api/onboarding/{id}/progress
async fn save_progress(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<StageSubmission>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    state.engine.save_progress(&ctx, id, &body).await?;
    Ok(Json(serde_json::json!({ "status": "saved" })))
}

/// POST /api/onboarding/{id}/owner
async fn assign_owner(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<AssignOwnerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    state.engine.assign_owner(&ctx, id, body.user_id).await?;
    Ok(Json(serde_json::json!({ "status": "assigned" })))
}

/// POST /api/onboarding/{id}/handoff
async fn complete_handoff(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    let patient_id = state.engine.complete_handoff(&ctx, id).await?;
    Ok(Json(serde_json::json!({ "patient_id": patient_id })))
}

/// POST /api/onboarding/tasks/{task_id}/status
async fn update_task_status(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    Path(task_id): Path<i64>,
    Json(body): Json<TaskUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    Ok(Json(state.engine.update_task_status(&ctx, task_id, &body).await?))
}

/// Build the onboarding REST routes.
pub fn onboarding_routes(state: OnboardingRouteState) -> Router {
    Router::new()
        .route("/api/onboarding", post(create_record))
        .route("/api/onboarding/queue", get(list_queue))
        .route("/api/onboarding/stats", get(queue_stats))
        .route("/api/onboarding/{id}", get(details))
        .route("/api/onboarding/{id}/stages/{stage}/advance", post(advance_stage))
        .route("/api/onboarding/{id}/submit", post(complete_stage))
        .route("/api/onboarding/{id}/progress", post(save_progress))
        .route("/api/onboarding/{id}/owner", post(assign_owner))
        .route("/api/onboarding/{id}/handoff", post(complete_handoff))
        .route("/api/onboarding/tasks/{task_id}/status", post(update_task_status))
        .with_state(state)
}
