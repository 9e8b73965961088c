//! REST endpoints for region reconciliation and provider service areas.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::server::{ApiError, context_from_headers};

use super::model::NewRegion;
use super::reconcile::RegionReconciler;

#[derive(Debug, Deserialize)]
struct AssignRegionRequest {
    region_id: i64,
}

/// POST /api/regions
async fn create_region(
    State(reconciler): State<Arc<RegionReconciler>>,
    headers: HeaderMap,
    Json(body): Json<NewRegion>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    let region_id = reconciler.create_region(&ctx, &body).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "region_id": region_id })),
    ))
}

/// POST /api/patients/{id}/region
async fn assign_patient_region(
    State(reconciler): State<Arc<RegionReconciler>>,
    headers: HeaderMap,
    Path(patient_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    Ok(Json(reconciler.assign_patient_to_region(&ctx, patient_id).await?))
}

/// POST /api/providers/{id}/regions
async fn assign_provider_region(
    State(reconciler): State<Arc<RegionReconciler>>,
    headers: HeaderMap,
    Path(provider_id): Path<i64>,
    Json(body): Json<AssignRegionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    reconciler
        .assign_provider_region(&ctx, provider_id, body.region_id)
        .await?;
    Ok(Json(serde_json::json!({ "status": "assigned" })))
}

/// GET /api/providers/{id}/regions/{region_id}
async fn provider_serves_region(
    State(reconciler): State<Arc<RegionReconciler>>,
    Path((provider_id, region_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let serves = reconciler.provider_serves_region(provider_id, region_id).await?;
    Ok(Json(serde_json::json!({ "serves": serves })))
}

/// GET /api/providers/{id}/counties
async fn provider_counties(
    State(reconciler): State<Arc<RegionReconciler>>,
    Path(provider_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(reconciler.list_provider_counties(provider_id).await?))
}

/// GET /api/providers/{id}/zip-codes
async fn provider_zip_codes(
    State(reconciler): State<Arc<RegionReconciler>>,
    Path(provider_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(reconciler.list_provider_zip_codes(provider_id).await?))
}

/// GET /api/providers/{id}/patients/{patient_id}/outside
async fn patient_outside(
    State(reconciler): State<Arc<RegionReconciler>>,
    Path((provider_id, patient_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let outside = reconciler
        .is_patient_outside_provider_region(patient_id, provider_id)
        .await?;
    Ok(Json(serde_json::json!({ "outside": outside })))
}

pub fn region_routes(reconciler: Arc<RegionReconciler>) -> Router {
    Router::new()
        .route("/api/regions", post(create_region))
        .route("/api/patients/{id}/region", post(assign_patient_region))
        .route("/api/providers/{id}/regions", post(assign_provider_region))
        .route("/api/providers/{id}/regions/{region_id}", get(provider_serves_region))
        .route("/api/providers/{id}/counties", get(provider_counties))
        .route("/api/providers/{id}/zip-codes", get(provider_zip_codes))
        .route(
            "/api/providers/{id}/patients/{patient_id}/outside",
            get(patient_outside),
        )
        .with_state(reconciler)
}
