//! HTTP surface.
//!
//! Every response is a JSON envelope carrying `success`; failures add an
//! `error` string. Handlers stay thin and defer to [`FetchService`].

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, Request, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use log::error;
use serde::{Deserialize, Serialize};

use crate::{
    error::FetchError,
    fetch::{CacheStats, CaptionsResult, FetchService, Source},
    security::ProxySecret,
    transcripts::Transcript,
    upstream::VideoMetadata,
};

pub const DEFAULT_LIST_LIMIT: u32 = 50;
pub const MAX_LIST_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct AppState {
    service: Arc<FetchService>,
    secret: ProxySecret,
}

impl AppState {
    pub fn new(service: FetchService, secret: ProxySecret) -> Self {
        Self {
            service: Arc::new(service),
            secret,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        let status = match &err {
            FetchError::InvalidVideoReference(_) => StatusCode::BAD_REQUEST,
            FetchError::NotFound(_) => StatusCode::NOT_FOUND,
            FetchError::Upstream(_) | FetchError::UpstreamLookup(_) => StatusCode::BAD_GATEWAY,
            FetchError::Internal(inner) => {
                error!("internal error: {inner:#}");
                return Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "Internal server error".into(),
                };
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
pub struct ResultEnvelope<T> {
    success: bool,
    result: T,
}

impl<T> ResultEnvelope<T> {
    fn ok(result: T) -> Json<Self> {
        Json(Self {
            success: true,
            result,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct FetchEnvelope {
    success: bool,
    source: Source,
    result: Transcript,
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    limit: u32,
    offset: u32,
    total: u64,
}

#[derive(Debug, Serialize)]
pub struct ListEnvelope {
    success: bool,
    result: Vec<Transcript>,
    pagination: Pagination,
}

#[derive(Debug, Serialize)]
pub struct CachedEnvelope<T> {
    success: bool,
    cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_age: Option<u64>,
    result: T,
}

#[derive(Debug, Serialize)]
pub struct CacheClearEnvelope {
    success: bool,
    message: String,
    cleared_keys: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct Health {
    status: &'static str,
    timestamp: DateTime<Utc>,
}

fn default_languages() -> String {
    crate::fetch::DEFAULT_LANGUAGES.to_string()
}

#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    video: String,
    #[serde(default = "default_languages")]
    languages: String,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct VideoQuery {
    video: String,
}

#[derive(Debug, Deserialize)]
pub struct CaptionsQuery {
    video: String,
    #[serde(default = "default_languages")]
    languages: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/transcripts", get(list_transcripts))
        .route("/transcripts/fetch", post(fetch_transcript))
        .route(
            "/transcripts/{video_id}",
            get(get_transcript).delete(delete_transcript),
        )
        .route("/youtube/metadata", get(youtube_metadata))
        .route("/youtube/captions", get(youtube_captions))
        .route("/youtube/cache/stats", get(cache_stats))
        .route("/youtube/cache/clear", delete(cache_clear))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_proxy_secret,
        ))
        .route("/health", get(health))
        .with_state(state)
}

async fn require_proxy_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.secret.is_authorized(request.headers()) {
        next.run(request).await
    } else {
        ApiError::forbidden("Unauthorized: Invalid or missing X-RapidAPI-Proxy-Secret header")
            .into_response()
    }
}

async fn health() -> Json<Health> {
    Json(Health {
        status: "ok",
        timestamp: Utc::now(),
    })
}

async fn fetch_transcript(
    State(state): State<AppState>,
    body: Result<Json<FetchRequest>, JsonRejection>,
) -> ApiResult<FetchEnvelope> {
    let Json(request) = body?;
    let (result, source) = state
        .service
        .fetch_transcript(&request.video, &request.languages, request.force)
        .await?;
    Ok(Json(FetchEnvelope {
        success: true,
        source,
        result,
    }))
}

async fn list_transcripts(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<ListEnvelope> {
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if !(1..=MAX_LIST_LIMIT).contains(&limit) {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {MAX_LIST_LIMIT}"
        )));
    }
    let offset = query.offset.unwrap_or(0);

    let (result, total) = state.service.list_transcripts(limit, offset).await?;
    Ok(Json(ListEnvelope {
        success: true,
        result,
        pagination: Pagination {
            limit,
            offset,
            total,
        },
    }))
}

async fn get_transcript(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
) -> ApiResult<ResultEnvelope<Transcript>> {
    let Path(video_id) = path?;
    let transcript = state.service.get_transcript(&video_id).await?;
    Ok(ResultEnvelope::ok(transcript))
}

async fn delete_transcript(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
) -> ApiResult<ResultEnvelope<Transcript>> {
    let Path(video_id) = path?;
    let transcript = state.service.delete_transcript(&video_id).await?;
    Ok(ResultEnvelope::ok(transcript))
}

async fn youtube_metadata(
    State(state): State<AppState>,
    query: Result<Query<VideoQuery>, QueryRejection>,
) -> ApiResult<CachedEnvelope<VideoMetadata>> {
    let Query(query) = query?;
    let cached = state.service.metadata(&query.video).await?;
    Ok(Json(CachedEnvelope {
        success: true,
        cached: cached.is_cached(),
        cache_age: cached.cache_age,
        result: cached.value,
    }))
}

async fn youtube_captions(
    State(state): State<AppState>,
    query: Result<Query<CaptionsQuery>, QueryRejection>,
) -> ApiResult<CachedEnvelope<CaptionsResult>> {
    let Query(query) = query?;
    let cached = state
        .service
        .captions(&query.video, &query.languages)
        .await?;
    Ok(Json(CachedEnvelope {
        success: true,
        cached: cached.is_cached(),
        cache_age: cached.cache_age,
        result: cached.value,
    }))
}

async fn cache_stats(State(state): State<AppState>) -> ApiResult<ResultEnvelope<CacheStats>> {
    Ok(ResultEnvelope::ok(state.service.cache_stats()))
}

async fn cache_clear(
    State(state): State<AppState>,
    query: Result<Query<VideoQuery>, QueryRejection>,
) -> ApiResult<CacheClearEnvelope> {
    let Query(query) = query?;
    let cleared_keys = state.service.clear_cache(&query.video).await?;
    let message = if state.service.cache_stats().enabled {
        format!("Cache cleared for video {}", query.video)
    } else {
        "Cache backend not configured; nothing to clear".to_string()
    };
    Ok(Json(CacheClearEnvelope {
        success: true,
        message,
        cleared_keys,
    }))
}
