//! REST endpoints for patients, caseloads, and staff records.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::server::{ApiError, context_from_headers};

use super::model::{NewPatient, NewUser};
use super::service::PatientRegistry;

#[derive(Debug, Deserialize)]
struct StatusRequest {
    status: String,
}

#[derive(Debug, Deserialize)]
struct AssignUserRequest {
    user_id: i64,
}

/// POST /api/patients
async fn create_patient(
    State(registry): State<Arc<PatientRegistry>>,
    headers: HeaderMap,
    Json(body): Json<NewPatient>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    let patient_id = registry.create(&ctx, &body).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "patient_id": patient_id })),
    ))
}

/// GET /api/patients/{id}
async fn get_patient(
    State(registry): State<Arc<PatientRegistry>>,
    Path(patient_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(registry.get(patient_id).await?))
}

/// POST /api/patients/{id}/status
async fn update_status(
    State(registry): State<Arc<PatientRegistry>>,
    headers: HeaderMap,
    Path(patient_id): Path<i64>,
    Json(body): Json<StatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    Ok(Json(
        registry.update_status(&ctx, patient_id, &body.status).await?,
    ))
}

async fn status_types(State(registry): State<Arc<PatientRegistry>>) -> impl IntoResponse {
    Json(registry.status_types())
}

/// POST /api/patients/{id}/assignments
async fn assign_user(
    State(registry): State<Arc<PatientRegistry>>,
    headers: HeaderMap,
    Path(patient_id): Path<i64>,
    Json(body): Json<AssignUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    let added = registry.assign_user(&ctx, patient_id, body.user_id).await?;
    Ok(Json(serde_json::json!({ "assigned": added })))
}

/// GET /api/users/{id}/patients
async fn user_patients(
    State(registry): State<Arc<PatientRegistry>>,
    Path(user_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(registry.assignments(user_id).await?))
}

/// POST /api/users
async fn create_user(
    State(registry): State<Arc<PatientRegistry>>,
    headers: HeaderMap,
    Json(body): Json<NewUser>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    let user_id = registry.create_user(&ctx, &body).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "user_id": user_id })),
    ))
}

/// GET /api/users/{id}
async fn get_user(
    State(registry): State<Arc<PatientRegistry>>,
    Path(user_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(registry.get_user(user_id).await?))
}

/// POST /api/users/{id}/provider
async fn register_provider(
    State(registry): State<Arc<PatientRegistry>>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    let provider_id = registry.create_provider(&ctx, user_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "provider_id": provider_id })),
    ))
}

/// POST /api/users/{id}/coordinator
async fn register_coordinator(
    State(registry): State<Arc<PatientRegistry>>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    let coordinator_id = registry.create_coordinator(&ctx, user_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "coordinator_id": coordinator_id })),
    ))
}

pub fn patient_routes(registry: Arc<PatientRegistry>) -> Router {
    Router::new()
        .route("/api/patients", post(create_patient))
        .route("/api/patients/{id}", get(get_patient))
        .route("/api/patients/{id}/status", post(update_status))
        .route("/api/patients/{id}/assignments", post(assign_user))
        .route("/api/patient-statuses", get(status_types))
        .route("/api/users", post(create_user))
        .route("/api/users/{id}", get(get_user))
        .route("/api/users/{id}/patients", get(user_patients))
        .route("/api/users/{id}/provider", post(register_provider))
        .route("/api/users/{id}/coordinator", post(register_coordinator))
        .with_state(registry)
}
