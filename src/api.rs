use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::error::StoreError;
use crate::ingest::scheduler::{SchedulerStatus, StatusHandle};
use crate::model::EventRecord;
use crate::store::{Stats, StatsWindow, Store};

pub const DEFAULT_RECENT_LIMIT: usize = 200;
pub const MAX_RECENT_LIMIT: usize = 1000;
pub const DEFAULT_STATS_HOURS: i64 = 24;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub status: StatusHandle,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/events/recent", get(events_recent))
        .route("/events/since", get(events_since))
        .route("/stats", get(stats))
        .route("/status", get(status))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Store failures as `500 {"error": kind, "message": ...}`.
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!(target: "api", kind = self.0.kind(), error = %self.0, "store query failed");
        let body = serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn events_recent(
    State(state): State<AppState>,
    Query(q): Query<RecentQuery>,
) -> Result<Json<Vec<EventRecord>>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_RECENT_LIMIT).min(MAX_RECENT_LIMIT);
    Ok(Json(state.store.query_recent(limit).await?))
}

#[derive(Deserialize)]
struct SinceQuery {
    ts: DateTime<Utc>,
}

async fn events_since(
    State(state): State<AppState>,
    Query(q): Query<SinceQuery>,
) -> Result<Json<Vec<EventRecord>>, ApiError> {
    Ok(Json(state.store.query_since(q.ts).await?))
}

#[derive(Deserialize)]
struct StatsQuery {
    hours: Option<i64>,
}

async fn stats(
    State(state): State<AppState>,
    Query(q): Query<StatsQuery>,
) -> Result<Json<Stats>, ApiError> {
    let hours = q.hours.unwrap_or(DEFAULT_STATS_HOURS).clamp(1, 24 * 366);
    let window = StatsWindow::last(ChronoDuration::hours(hours), Utc::now());
    Ok(Json(state.store.aggregate_stats(window).await?))
}

async fn status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.status.snapshot())
}
