//! HTTP surface: shared service state and error mapping for the JSON API.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::aggregation::{TaskAggregator, aggregation_routes};
use crate::context::{RequestContext, Role};
use crate::error::{DatabaseError, Error};
use crate::onboarding::{OnboardingEngine, OnboardingRouteState, onboarding_routes};
use crate::patients::{PatientRegistry, patient_routes};
use crate::regions::{RegionReconciler, region_routes};

/// Caller identity header.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Comma-separated caller roles.
pub const USER_ROLES_HEADER: &str = "x-user-roles";

/// Services shared by every router.
#[derive(Clone)]
pub struct AppState {
    pub onboarding: Arc<OnboardingEngine>,
    pub regions: Arc<RegionReconciler>,
    pub aggregation: Arc<TaskAggregator>,
    pub patients: Arc<PatientRegistry>,
}

/// Error returned by handlers, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Core(Error),
}

impl<E: Into<Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self::Core(err.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Core(Error::Validation(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Core(Error::PermissionDenied { .. }) => StatusCode::FORBIDDEN,
            Self::Core(Error::Database(DatabaseError::NotFound { .. })) => StatusCode::NOT_FOUND,
            Self::Core(Error::Database(DatabaseError::Constraint(_))) => StatusCode::CONFLICT,
            Self::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::BadRequest(message) => message.clone(),
            Self::Core(err) => err.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Build the caller's context from the identity headers.
pub fn context_from_headers(headers: &HeaderMap) -> Result<RequestContext, ApiError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing X-User-Id header".into()))?
        .trim()
        .parse::<i64>()
        .map_err(|_| ApiError::BadRequest("X-User-Id must be an integer".into()))?;

    let roles = match headers.get(USER_ROLES_HEADER).and_then(|v| v.to_str().ok()) {
        Some(raw) => raw
            .split(',')
            .filter(|r| !r.trim().is_empty())
            .map(|r| r.parse::<Role>())
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    Ok(RequestContext::new(user_id, roles))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Assemble every route with tracing and CORS layers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(onboarding_routes(OnboardingRouteState {
            engine: state.onboarding,
        }))
        .merge(region_routes(state.regions))
        .merge(aggregation_routes(state.aggregation))
        .merge(patient_routes(state.patients))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use tower::ServiceExt;

    use super::*;
    use crate::aggregation::TaskAggregator;
    use crate::config::RegionConfig;
    use crate::error::ValidationError;
    use crate::store::{Database, LibSqlBackend};

    async fn test_app() -> Router {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        app(AppState {
            onboarding: Arc::new(OnboardingEngine::new(Arc::clone(&db))),
            regions: Arc::new(RegionReconciler::new(Arc::clone(&db), RegionConfig::default())),
            aggregation: Arc::new(TaskAggregator::new(Arc::clone(&db))),
            patients: Arc::new(PatientRegistry::new(db)),
        })
    }

    #[test]
    fn test_context_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("7"));
        headers.insert(USER_ROLES_HEADER, HeaderValue::from_static("admin, onboarding"));
        let ctx = context_from_headers(&headers).unwrap();
        assert_eq!(ctx.user_id, 7);
        assert!(ctx.has_role(Role::Admin));
        assert!(ctx.has_role(Role::Onboarding));
    }

    #[test]
    fn test_context_rejects_bad_headers() {
        let headers = HeaderMap::new();
        assert!(matches!(
            context_from_headers(&headers),
            Err(ApiError::BadRequest(_))
        ));

        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("3"));
        headers.insert(USER_ROLES_HEADER, HeaderValue::from_static("admin,janitor"));
        let err = context_from_headers(&headers).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ApiError::from(ValidationError::MissingField { field: "last_name" }),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ApiError::from(Error::not_found("onboarding", 1)),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(DatabaseError::Constraint("dup".into())),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(Error::PermissionDenied {
                    action: "x".into(),
                    user_id: 1,
                }),
                StatusCode::FORBIDDEN,
            ),
            (
                ApiError::from(DatabaseError::Query("boom".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status);
        }
    }

    #[tokio::test]
    async fn test_router_health_and_errors() {
        let app = test_app().await;

        let resp = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(Request::get("/api/onboarding/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(
                Request::post("/api/service-areas/refresh")
                    .header(USER_ID_HEADER, "1")
                    .header(USER_ROLES_HEADER, "onboarding")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
