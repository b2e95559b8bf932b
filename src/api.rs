//! HTTP surface. Every failure leaves as `{success: false, error}`.

use crate::errors::AppError;
use crate::models::{
    parse_metric, BooleanResponse, ClearResponse, ErrorResponse, FeatureMap, FileUpload, GroupDimension,
    HealthResponse, IngestResponse, KpiFilters, KpiRequest, KpiResponse, MetricPoint, PointSource,
};
use crate::period::{parse_period, Period, PeriodRange};
use crate::service::{DashboardCore, UploadRequest};
use axum::{
    extract::{
        multipart::MultipartRejection, rejection::QueryRejection,
        DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ApiState {
    pub core: Arc<DashboardCore>,
}

pub struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(value: AppError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::FeatureDisabled(_) => StatusCode::FORBIDDEN,
            error if error.is_client_input() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, "request rejected");
        }
        let body = ErrorResponse {
            success: false,
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(AppError::InvalidRequest(rejection.body_text()))
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        Self(AppError::InvalidRequest(rejection.body_text()))
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// `Query` whose rejections leave through the JSON error envelope.
#[derive(FromRequestParts)]
#[from_request(via(Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

#[derive(Debug, Deserialize)]
pub struct MetricQuery {
    pub metric: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    pub period: String,
    pub metric: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClearQuery {
    pub period: String,
    pub metric: Option<String>,
    /// Also drop the upload records instead of marking them inactive.
    pub hard: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiQuery {
    pub metric: Option<String>,
    pub period: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub dimension: Option<String>,
    pub group_a: Option<String>,
    pub group_b: Option<String>,
    pub group_c: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadsQuery {
    pub include_inactive: Option<bool>,
}

async fn ingest(
    State(state): State<ApiState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<IngestResponse> {
    let mut multipart = multipart?;
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut kind: Option<PointSource> = None;
    let mut metric: Option<String> = None;
    let mut period: Option<Period> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| AppError::UnreadableFile(format!("malformed multipart body: {}", error)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("upload.csv").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|error| AppError::UnreadableFile(format!("failed to read upload: {}", error)))?;
                file = Some((file_name, bytes.to_vec()));
            }
            "kind" | "metric" | "period" => {
                let text = field
                    .text()
                    .await
                    .map_err(|error| AppError::InvalidRequest(format!("failed to read field '{}': {}", name, error)))?;
                match name.as_str() {
                    "kind" => kind = Some(text.parse()?),
                    "metric" => metric = Some(text),
                    _ if text.trim().is_empty() => {}
                    _ => period = Some(parse_period(&text)?),
                }
            }
            _ => {}
        }
    }

    let (file_name, bytes) = file.ok_or_else(|| AppError::InvalidRequest("multipart field 'file' is required".to_string()))?;
    let kind = kind.ok_or_else(|| AppError::InvalidRequest("multipart field 'kind' is required".to_string()))?;
    let metric = parse_metric(metric.as_deref())?;

    let response = state
        .core
        .ingest_upload(UploadRequest {
            file_name,
            bytes,
            kind,
            metric,
            fallback_period: period,
        })
        .await?;
    Ok(Json(response))
}

async fn latest_period(State(state): State<ApiState>, ApiQuery(query): ApiQuery<MetricQuery>) -> ApiResult<Option<String>> {
    let metric = parse_metric(query.metric.as_deref())?;
    Ok(Json(state.core.latest_period(metric)?))
}

async fn list_periods(State(state): State<ApiState>, ApiQuery(query): ApiQuery<MetricQuery>) -> ApiResult<Vec<String>> {
    let metric = parse_metric(query.metric.as_deref())?;
    Ok(Json(state.core.list_periods(metric)?))
}

async fn breakdown(State(state): State<ApiState>, ApiQuery(query): ApiQuery<PeriodQuery>) -> ApiResult<Vec<MetricPoint>> {
    let metric = parse_metric(query.metric.as_deref())?;
    Ok(Json(state.core.breakdown(&query.period, metric)?))
}

async fn clear(State(state): State<ApiState>, ApiQuery(query): ApiQuery<ClearQuery>) -> ApiResult<ClearResponse> {
    let metric = parse_metric(query.metric.as_deref())?;
    let response = if query.hard.unwrap_or(false) {
        state.core.purge_period(&query.period, metric)?
    } else {
        state.core.clear_period(&query.period, metric)?
    };
    Ok(Json(response))
}

async fn kpi(State(state): State<ApiState>, ApiQuery(query): ApiQuery<KpiQuery>) -> ApiResult<KpiResponse> {
    let metric = parse_metric(query.metric.as_deref())?;
    let range = match (query.from.as_deref(), query.to.as_deref(), query.period.as_deref()) {
        (Some(from), Some(to), _) => PeriodRange::new(parse_period(from)?, parse_period(to)?)?,
        (Some(single), None, _) | (None, Some(single), _) | (None, None, Some(single)) => {
            PeriodRange::single(parse_period(single)?)
        }
        (None, None, None) => {
            let anchor = match state.core.latest_period(metric)? {
                Some(latest) => parse_period(&latest)?,
                None => Period::current(),
            };
            PeriodRange::single(anchor)
        }
    };
    let dimension = match query.dimension.as_deref() {
        Some(raw) if !raw.trim().is_empty() => raw.parse()?,
        _ => GroupDimension::default(),
    };

    let request = KpiRequest {
        metric,
        range,
        filters: KpiFilters {
            group_a: query.group_a,
            group_b: query.group_b,
            group_c: query.group_c,
        },
        dimension,
    };
    Ok(Json(state.core.get_kpi(&request)?))
}

async fn list_uploads(State(state): State<ApiState>, ApiQuery(query): ApiQuery<UploadsQuery>) -> ApiResult<Vec<FileUpload>> {
    Ok(Json(state.core.list_uploads(query.include_inactive.unwrap_or(false))?))
}

async fn delete_upload(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<BooleanResponse> {
    Ok(Json(state.core.delete_upload(&id)?))
}

async fn features(State(state): State<ApiState>) -> Json<FeatureMap> {
    Json(state.core.features())
}

async fn health(State(state): State<ApiState>) -> ApiResult<HealthResponse> {
    Ok(Json(state.core.health()?))
}

pub fn create_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = state.core.config().max_upload_bytes;

    Router::new()
        .route("/sync-like-ingestion", post(ingest))
        .route("/latest-period", get(latest_period))
        .route("/periods", get(list_periods))
        .route("/breakdown", get(breakdown))
        .route("/clear", delete(clear))
        .route("/kpi", get(kpi))
        .route("/uploads", get(list_uploads))
        .route("/uploads/:id", delete(delete_upload))
        .route("/features", get(features))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
