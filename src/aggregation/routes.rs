//! REST endpoints for task logs, summaries, and service-area caches.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::server::{ApiError, context_from_headers};

use super::model::{Granularity, NewBillingCode, StaffKind, TaskLogEntry};
use super::service::TaskAggregator;

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    #[serde(default)]
    staff_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct BillingQuery {
    year: i32,
    month: u32,
}

/// POST /api/task-logs/{kind}
async fn ingest(
    State(agg): State<Arc<TaskAggregator>>,
    headers: HeaderMap,
    Path(kind): Path<String>,
    Json(rows): Json<Vec<TaskLogEntry>>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    let kind = StaffKind::parse(&kind)?;
    let inserted = agg.ingest(&ctx, kind, &rows).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "inserted": inserted })),
    ))
}

/// POST /api/summaries/{kind}/{granularity}/refresh
async fn refresh_summaries(
    State(agg): State<Arc<TaskAggregator>>,
    headers: HeaderMap,
    Path((kind, granularity)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    let kind = StaffKind::parse(&kind)?;
    let report = match Granularity::parse(&granularity)? {
        Granularity::Monthly => agg.aggregate_monthly(&ctx, kind).await?,
        Granularity::Weekly => agg.aggregate_weekly(&ctx, kind).await?,
    };
    Ok(Json(report))
}

/// GET /api/summaries/{kind}/{granularity}?staff_id=
async fn list_summaries(
    State(agg): State<Arc<TaskAggregator>>,
    Path((kind, granularity)): Path<(String, String)>,
    Query(query): Query<SummaryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = StaffKind::parse(&kind)?;
    let granularity = Granularity::parse(&granularity)?;
    Ok(Json(agg.summaries(kind, granularity, query.staff_id).await?))
}

/// GET /api/billing/patients?year=&month=
async fn patient_billing(
    State(agg): State<Arc<TaskAggregator>>,
    Query(query): Query<BillingQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        agg.patient_monthly_billing(query.year, query.month).await?,
    ))
}

/// POST /api/billing/codes
async fn add_billing_code(
    State(agg): State<Arc<TaskAggregator>>,
    headers: HeaderMap,
    Json(body): Json<NewBillingCode>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    let code_id = agg.add_billing_code(&ctx, &body).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "code_id": code_id })),
    ))
}

async fn list_billing_codes(
    State(agg): State<Arc<TaskAggregator>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(agg.billing_codes().await?))
}

/// POST /api/service-areas/refresh
async fn refresh_service_areas(
    State(agg): State<Arc<TaskAggregator>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context_from_headers(&headers)?;
    Ok(Json(agg.refresh_service_area_maps(&ctx).await?))
}

pub fn aggregation_routes(agg: Arc<TaskAggregator>) -> Router {
    Router::new()
        .route("/api/task-logs/{kind}", post(ingest))
        .route("/api/summaries/{kind}/{granularity}", get(list_summaries))
        .route(
            "/api/summaries/{kind}/{granularity}/refresh",
            post(refresh_summaries),
        )
        .route("/api/billing/patients", get(patient_billing))
        .route(
            "/api/billing/codes",
            get(list_billing_codes).post(add_billing_code),
        )
        .route("/api/service-areas/refresh", post(refresh_service_areas))
        .with_state(agg)
}
