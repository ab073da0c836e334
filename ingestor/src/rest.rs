use crate::auth::{AccessTokens, Caller};
use crate::errors::IngestError;
use crate::gateway::Gateways;
use crate::metrics::{gather_metrics, REJECTIONS_TOTAL};
use crate::model::{
    Dashboard, DeviceIngestRequest, FieldDescriptor, IngestResponse, ManualIngestRequest, Reading,
    TimeRange,
};
use crate::query::{DashboardSeries, DashboardStats, QueryService, DEFAULT_HOURS, DEFAULT_LIMIT};
use crate::store::{DashboardRegistry, ReadingStore};
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub gateways: Gateways,
    pub query: QueryService,
    pub registry: Arc<dyn DashboardRegistry>,
    pub store: Arc<dyn ReadingStore>,
    pub tokens: Arc<AccessTokens>,
}

#[derive(Debug, Deserialize)]
pub struct SeriesParams {
    hours: Option<u32>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct FieldSeries {
    pub dashboard_id: String,
    pub field_name: String,
    pub time_range: TimeRange,
    pub data: Vec<Reading>,
}

#[derive(Debug, Serialize)]
pub struct DashboardFields {
    pub dashboard_id: String,
    pub dashboard_name: String,
    pub fields: Vec<FieldDescriptor>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/device-ingest", post(device_ingest))
        .route(
            "/api/v1/dashboard/:dashboard_id/field/:field_name/data",
            post(manual_ingest).get(field_series),
        )
        .route("/api/v1/dashboard/:dashboard_id/data", get(dashboard_series))
        .route("/api/v1/dashboard/:dashboard_id/fields", get(dashboard_fields))
        .route("/api/v1/dashboard/:dashboard_id/stats", get(dashboard_stats))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn device_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<DeviceIngestRequest>, JsonRejection>,
) -> Result<Json<IngestResponse>, ApiError> {
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    // A missing key outranks a malformed body
    if api_key.map_or(true, |k| k.trim().is_empty()) {
        return Err(rejected(IngestError::Unauthenticated(
            "Missing API key".to_string(),
        )));
    }
    let Json(request) = body.map_err(invalid_body)?;

    let receipt = state.gateways.ingest_device(api_key, request).await?;
    Ok(Json(receipt.into()))
}

async fn manual_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<(String, String)>, PathRejection>,
    body: Result<Json<ManualIngestRequest>, JsonRejection>,
) -> Result<Json<IngestResponse>, ApiError> {
    let caller = authenticate(&state, &headers)?;
    let Path((dashboard_id, field_name)) = path.map_err(invalid_path)?;
    let Json(request) = body.map_err(invalid_body)?;

    let receipt = state
        .gateways
        .ingest_manual(&caller, &dashboard_id, &field_name, request)
        .await?;
    Ok(Json(receipt.into()))
}

async fn field_series(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<(String, String)>, PathRejection>,
    params: Result<Query<SeriesParams>, QueryRejection>,
) -> Result<Json<FieldSeries>, ApiError> {
    let caller = authenticate(&state, &headers)?;
    let Path((dashboard_id, field_name)) = path.map_err(invalid_path)?;
    let Query(params) = params.map_err(invalid_query)?;
    let dashboard = visible_dashboard(&state, &caller, &dashboard_id).await?;
    if !dashboard.has_field(&field_name) {
        return Err(IngestError::NotFound(format!(
            "Field '{}' not found in dashboard '{}'",
            field_name, dashboard_id
        ))
        .into());
    }

    let window = state
        .query
        .last_hours(params.hours.unwrap_or(DEFAULT_HOURS))
        .map_err(IngestError::from)?;
    let data = state
        .query
        .series_for(
            &dashboard.id,
            &field_name,
            &window,
            params.limit.unwrap_or(DEFAULT_LIMIT),
        )
        .await
        .map_err(IngestError::from)?;

    Ok(Json(FieldSeries {
        dashboard_id: dashboard.id,
        field_name,
        time_range: window,
        data,
    }))
}

async fn dashboard_series(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<String>, PathRejection>,
    params: Result<Query<SeriesParams>, QueryRejection>,
) -> Result<Json<DashboardSeries>, ApiError> {
    let caller = authenticate(&state, &headers)?;
    let Path(dashboard_id) = path.map_err(invalid_path)?;
    let Query(params) = params.map_err(invalid_query)?;
    let dashboard = visible_dashboard(&state, &caller, &dashboard_id).await?;

    let window = state
        .query
        .last_hours(params.hours.unwrap_or(DEFAULT_HOURS))
        .map_err(IngestError::from)?;
    let series = state
        .query
        .series_for_all(&dashboard, window, params.limit.unwrap_or(DEFAULT_LIMIT))
        .await
        .map_err(IngestError::from)?;
    Ok(Json(series))
}

async fn dashboard_fields(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<String>, PathRejection>,
) -> Result<Json<DashboardFields>, ApiError> {
    let caller = authenticate(&state, &headers)?;
    let Path(dashboard_id) = path.map_err(invalid_path)?;
    let dashboard = visible_dashboard(&state, &caller, &dashboard_id).await?;

    Ok(Json(DashboardFields {
        fields: state.query.current_values(&dashboard),
        dashboard_id: dashboard.id,
        dashboard_name: dashboard.name,
    }))
}

async fn dashboard_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<String>, PathRejection>,
) -> Result<Json<DashboardStats>, ApiError> {
    let caller = authenticate(&state, &headers)?;
    let Path(dashboard_id) = path.map_err(invalid_path)?;
    let dashboard = visible_dashboard(&state, &caller, &dashboard_id).await?;

    let stats = state
        .query
        .stats(&dashboard)
        .await
        .map_err(IngestError::from)?;
    Ok(Json(stats))
}

async fn health(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(json!({ "status": "healthy", "database": "connected" })).into_response(),
        Err(e) => {
            warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "database": "unreachable" })),
            )
                .into_response()
        }
    }
}

async fn metrics_handler() -> String {
    gather_metrics()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Caller, ApiError> {
    Ok(state.tokens.authenticate(bearer_token(headers))?)
}

async fn visible_dashboard(
    state: &AppState,
    caller: &Caller,
    dashboard_id: &str,
) -> Result<Dashboard, ApiError> {
    let dashboard = state
        .registry
        .dashboard(dashboard_id)
        .await
        .map_err(IngestError::from)?
        .ok_or_else(|| IngestError::NotFound(format!("Dashboard '{}' not found", dashboard_id)))?;

    if !dashboard.is_visible_to(&caller.user_id, caller.is_admin) {
        return Err(IngestError::Unauthorized(
            "Not authorized to access this dashboard".to_string(),
        )
        .into());
    }
    Ok(dashboard)
}

fn invalid_body(rejection: JsonRejection) -> ApiError {
    rejected(IngestError::InvalidValue(rejection.body_text()))
}

fn invalid_query(rejection: QueryRejection) -> ApiError {
    IngestError::InvalidValue(rejection.body_text()).into()
}

fn invalid_path(rejection: PathRejection) -> ApiError {
    IngestError::InvalidValue(rejection.body_text()).into()
}

/// Rejections raised before a gateway sees the request.
fn rejected(err: IngestError) -> ApiError {
    debug!("Ingestion rejected: {}", err);
    REJECTIONS_TOTAL.with_label_values(&[err.code()]).inc();
    err.into()
}

/// HTTP rendering of an [`IngestError`].
#[derive(Debug)]
pub struct ApiError(IngestError);

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            IngestError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            IngestError::Unauthorized(_) => StatusCode::FORBIDDEN,
            IngestError::NotFound(_) => StatusCode::NOT_FOUND,
            IngestError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            IngestError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };

        let detail = match &self.0 {
            IngestError::StoreUnavailable { detail, .. } => {
                error!("API error: {}", detail);
                "Storage is temporarily unavailable".to_string()
            }
            IngestError::Unauthenticated(msg)
            | IngestError::Unauthorized(msg)
            | IngestError::NotFound(msg)
            | IngestError::InvalidValue(msg) => msg.clone(),
        };

        let body = Json(json!({ "error": self.0.code(), "detail": detail }));
        match self.0 {
            IngestError::StoreUnavailable {
                retryable: true, ..
            } => (status, [(header::RETRY_AFTER, "1")], body).into_response(),
            _ => (status, body).into_response(),
        }
    }
}
