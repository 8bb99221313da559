// tests/api_http.rs
//
// HTTP-level tests for the read API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value as Json;
use std::time::Duration;
use tower::ServiceExt as _; // for `oneshot`

use quake_watch::api::{create_router, AppState};
use quake_watch::ingest::scheduler::StatusHandle;
use quake_watch::{EventRecord, Store};

const BODY_LIMIT: usize = 1024 * 1024;

async fn test_router(dir: &tempfile::TempDir, records: &[EventRecord]) -> (Router, Store) {
    let store = Store::open(dir.path().join("events.db"), Duration::from_secs(5))
        .await
        .unwrap();
    store.upsert_batch(records).await.unwrap();
    let state = AppState {
        store: store.clone(),
        status: StatusHandle::default(),
    };
    (create_router(state), store)
}

fn recent_records(n: i64) -> Vec<EventRecord> {
    let now = Utc::now();
    (0..n)
        .map(|i| {
            let t = now - ChronoDuration::minutes(i * 10);
            EventRecord::new(t, 38.0, 27.0 + i as f64 / 100.0, 2.0 + i as f64 / 10.0, now)
                .unwrap()
                .with_depth(Some(5.0))
        })
        .collect()
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Json) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    let resp = app.oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body");
    let json = serde_json::from_slice(&bytes).unwrap_or(Json::Null);
    (status, json)
}

#[tokio::test]
async fn health_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = test_router(&dir, &[]).await;
    let req = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn recent_honours_limit_and_order() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = test_router(&dir, &recent_records(6)).await;

    let (status, body) = get_json(app.clone(), "/events/recent?limit=4").await;
    assert_eq!(status, StatusCode::OK);
    let rows = body.as_array().expect("array");
    assert_eq!(rows.len(), 4);
    let first = rows[0]["occurred_at"].as_str().unwrap().to_string();
    let second = rows[1]["occurred_at"].as_str().unwrap().to_string();
    assert!(first > second, "newest first: {first} vs {second}");
    assert!(rows[0]["identity_key"].is_string());

    let (_, body) = get_json(app, "/events/recent").await;
    assert_eq!(body.as_array().unwrap().len(), 6);
}

#[tokio::test]
async fn since_filters_by_time() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = test_router(&dir, &recent_records(6)).await;

    let ts = (Utc::now() - ChronoDuration::minutes(25))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string();
    let (status, body) = get_json(app, &format!("/events/since?ts={ts}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn since_without_ts_is_a_client_error() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = test_router(&dir, &[]).await;
    let (status, _) = get_json(app, "/events/since").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stats_cover_the_requested_hours() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = test_router(&dir, &recent_records(6)).await;

    let (status, body) = get_json(app.clone(), "/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 6);
    assert_eq!(body["mean_depth_km"], 5.0);

    let (_, last_hour) = get_json(app, "/stats?hours=1").await;
    assert_eq!(last_hour["count"], 6);
}

#[tokio::test]
async fn stats_on_empty_store_have_nulls() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = test_router(&dir, &[]).await;
    let (_, body) = get_json(app, "/stats").await;
    assert_eq!(body["count"], 0);
    assert!(body["mean_magnitude"].is_null());
    assert!(body["max_magnitude"].is_null());
}

#[tokio::test]
async fn status_reports_scheduler_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = test_router(&dir, &[]).await;
    let (status, body) = get_json(app, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "stopped");
    assert_eq!(body["cycles_run"], 0);
    assert!(body["last_outcome"].is_null());
}

#[tokio::test]
async fn store_failure_maps_to_500_json() {
    let dir = tempfile::tempdir().unwrap();
    let (app, store) = test_router(&dir, &[]).await;
    store.close().await;

    let (status, body) = get_json(app, "/events/recent").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "io_failure");
    assert!(body["message"].is_string());
}
