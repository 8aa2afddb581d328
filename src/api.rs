//! Thin HTTP router over the query path.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::fetcher::FluxFetcher;
use crate::storage::StorageError;

#[derive(Clone)]
pub struct ApiState {
    pub fetcher: Arc<FluxFetcher>,
    pub max_resolution: u32,
    pub query_timeout: Duration,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/flux", get(get_flux))
        .route("/status", get(get_status))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct FluxQuery {
    resolution: i64,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

/// The downsampling interval answering a request: `resolution` buckets over
/// the queried span, with the resolution clamped to the configured maximum.
fn query_interval(start: DateTime<Utc>, end: DateTime<Utc>, resolution: i64, max: u32) -> Duration {
    let resolution = resolution.clamp(1, max as i64);
    (end - start) / resolution as i32
}

async fn get_flux(
    State(state): State<ApiState>,
    Query(params): Query<FluxQuery>,
) -> Result<Json<Vec<(i64, f32)>>, ApiError> {
    let now = Utc::now();
    let start = match params.start {
        Some(start) => start,
        // Missing start means everything we have.
        None => state.fetcher.start().await.unwrap_or(now),
    };
    let end = params.end.unwrap_or(now);
    if start > end {
        return Err(ApiError::BadRequest("start must not be after end"));
    }

    let interval = query_interval(start, end, params.resolution, state.max_resolution);
    let rows = state
        .fetcher
        .fetch_raw(start, end, interval, Some(state.query_timeout))
        .await?;
    Ok(Json(rows))
}

#[derive(Debug, Serialize)]
struct Status {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

async fn get_status(State(state): State<ApiState>) -> Json<Status> {
    Json(Status {
        start: state.fetcher.start().await,
        end: state.fetcher.end().await,
    })
}

#[derive(Debug)]
enum ApiError {
    BadRequest(&'static str),
    Timeout,
    Internal(StorageError),
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::QueryTimeout => ApiError::Timeout,
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            ApiError::Timeout => {
                (StatusCode::SERVICE_UNAVAILABLE, "query timed out").into_response()
            }
            ApiError::Internal(err) => {
                error!("Flux query failed: {err}");
                (StatusCode::INTERNAL_SERVER_ERROR, "query failed").into_response()
            }
        }
    }
}
