//! JSON HTTP surface: attendance listing and submission, statistics, and the
//! class-session counter.

use std::future::{ready, Ready};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::config::ServiceConfig;
use crate::filter::{AttendanceQuery, AttendanceSubmission, FilterError};
use crate::models::{AttendanceRecord, StatisticsReport};
use crate::stats;
use crate::store::{AttendanceStore, StoreError};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn AttendanceStore>,
    pub config: Arc<ServiceConfig>,
}

impl AppState {
    pub fn new(store: Arc<dyn AttendanceStore>, config: ServiceConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("method not allowed, use {allow}")]
    MethodNotAllowed { allow: &'static str },
    #[error("{0}")]
    Conflict(String),
    #[error("internal server error: configuration incomplete")]
    NotConfigured,
    #[error("{context}")]
    Storage {
        context: &'static str,
        #[source]
        source: StoreError,
    },
}

impl ApiError {
    /// Maps a store failure, keeping `context` as the user-visible message.
    fn storage(context: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| match source {
            StoreError::NotConfigured => Self::NotConfigured,
            StoreError::Duplicate { .. } => Self::Conflict(source.to_string()),
            StoreError::CounterOverflow => Self::BadRequest(source.to_string()),
            StoreError::Database(_) => Self::Storage { context, source },
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Filter(_) => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotConfigured | Self::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            Self::Storage { context, source } => error!(error = %source, "{context}"),
            Self::NotConfigured => error!("DATABASE_URL is not configured"),
            _ => {}
        }

        let mut response =
            (self.status(), Json(json!({ "message": self.to_string() }))).into_response();
        if let Self::MethodNotAllowed { allow } = self {
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static(allow));
        }
        response
    }
}

fn method_not_allowed(
    allow: &'static str,
) -> impl Fn() -> Ready<ApiError> + Clone + Send + Sync + 'static {
    move || ready(ApiError::MethodNotAllowed { allow })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/attendance",
            get(list_attendance)
                .post(record_attendance)
                .fallback(method_not_allowed("GET, POST")),
        )
        .route(
            "/api/statistics",
            get(get_statistics).fallback(method_not_allowed("GET")),
        )
        .route(
            "/api/classes",
            get(get_class_count)
                .post(increment_class_count)
                .fallback(method_not_allowed("GET, POST")),
        )
        .with_state(state)
}

fn query_params(
    query: Result<Query<AttendanceQuery>, QueryRejection>,
) -> Result<AttendanceQuery, ApiError> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

async fn list_attendance(
    State(state): State<AppState>,
    query: Result<Query<AttendanceQuery>, QueryRejection>,
) -> Result<Json<Vec<AttendanceRecord>>, ApiError> {
    let filter = query_params(query)?.into_list_filter()?;
    let records = state
        .store
        .list_records(&filter)
        .await
        .map_err(ApiError::storage("failed to load attendance records"))?;
    Ok(Json(records))
}

async fn record_attendance(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::BadRequest("request body is empty".to_string()));
    }
    let submission: AttendanceSubmission = serde_json::from_slice(&body).map_err(|_| {
        ApiError::BadRequest("request body must be a JSON attendance object".to_string())
    })?;
    let record = submission.validate()?.into_record(Utc::now());

    state
        .store
        .insert_record(&record, state.config.duplicate_policy)
        .await
        .map_err(ApiError::storage("failed to save attendance"))?;

    info!(
        id = %record.id,
        student = %record.student_name,
        date = %record.date,
        "attendance recorded"
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": record.id, "message": "attendance recorded" })),
    ))
}

async fn get_statistics(
    State(state): State<AppState>,
    query: Result<Query<AttendanceQuery>, QueryRejection>,
) -> Result<Json<StatisticsReport>, ApiError> {
    let filter = query_params(query)?.into_stats_filter()?;
    let report = stats::compute_statistics(
        state.store.as_ref(),
        &filter,
        Utc::now().date_naive(),
        state.config.history_epoch,
    )
    .await
    .map_err(ApiError::storage("statistics unavailable"))?;
    Ok(Json(report))
}

async fn get_class_count(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let total = state
        .store
        .class_count_or_init()
        .await
        .map_err(ApiError::storage("failed to read the class counter"))?;
    Ok(Json(json!({ "totalClassesHeld": total })))
}

#[derive(Debug, Deserialize)]
struct IncrementRequest {
    increment: Option<Value>,
}

fn parse_increment(body: &[u8]) -> Result<i64, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(1);
    }
    let request: IncrementRequest = serde_json::from_slice(body)
        .map_err(|_| ApiError::BadRequest("request body must be a JSON object".to_string()))?;
    match request.increment {
        None | Some(Value::Null) => Ok(1),
        Some(value) => value.as_i64().filter(|n| *n > 0).ok_or_else(|| {
            ApiError::BadRequest("'increment' must be a positive integer".to_string())
        }),
    }
}

async fn increment_class_count(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let by = parse_increment(&body)?;
    let total = state
        .store
        .increment_class_count(by)
        .await
        .map_err(ApiError::storage("failed to update the class counter"))?;
    info!(by, total, "class counter incremented");
    Ok(Json(json!({ "totalClassesHeld": total })))
}
