//! HTTP surface integration tests.
//!
//! These exercise the router without a live broker or object store. The
//! store handle points at a closed port with a short server-selection
//! timeout, so read paths surface 5xx and health reports the store as down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::time::{Duration, Instant};

use axum::body::to_bytes;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use opsentra_aggregator::api::{ApiState, ApiStats, router};
use opsentra_aggregator::hub::SubscriberHub;
use opsentra_aggregator::store::LogStore;

const DEAD_STORE_URI: &str =
    "mongodb://127.0.0.1:1/?serverSelectionTimeoutMS=300&connectTimeoutMS=300";

async fn test_state(accepting: bool, broker_up: bool) -> Arc<ApiState> {
    let store = Arc::new(
        LogStore::connect(DEAD_STORE_URI)
            .await
            .expect("client construction is lazy and must succeed"),
    );
    let hub = Arc::new(SubscriberHub::new(16, Duration::from_secs(30)));
    Arc::new(ApiState {
        hub,
        store,
        broker_connected: Arc::new(AtomicBool::new(broker_up)),
        object_store_ok: Arc::new(AtomicBool::new(true)),
        stats: ApiStats {
            persisted: Arc::new(AtomicU64::new(0)),
            enriched: Arc::new(AtomicU64::new(0)),
            dead_lettered: Arc::new(AtomicU64::new(0)),
            archived: Arc::new(AtomicU64::new(0)),
        },
        started_at: Instant::now(),
        accepting_subscribers: Arc::new(AtomicBool::new(accepting)),
    })
}

#[tokio::test]
async fn health_reports_store_down() {
    let app = router(test_state(true, true).await);

    let response = app
        .oneshot(Request::get("/api/health").body(axum::body::Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(json["dependencies"]["store"], "down");
    assert_eq!(json["dependencies"]["broker"], "up");
    assert_eq!(json["subscribers"], 0);
    assert!(json["version"].as_str().is_some());
    assert!(json["stats"]["records_persisted"].is_number());
    // store down means the service cannot serve reads
    assert!(json["status"].to_string().to_lowercase().contains("unhealthy"));
}

#[tokio::test]
async fn fetch_returns_5xx_when_store_unreachable() {
    let app = router(test_state(true, true).await);

    let response = app
        .oneshot(
            Request::get("/api/logs?limit=10&service=nginx")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn services_returns_5xx_when_store_unreachable() {
    let app = router(test_state(true, true).await);

    let response = app
        .oneshot(Request::get("/api/services").body(axum::body::Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn stream_refused_during_shutdown() {
    let state = test_state(false, true).await;
    let app = router(Arc::clone(&state));

    let response = app
        .oneshot(
            Request::get("/api/logs/stream?service=nginx")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(state.hub.subscriber_count(), 0);
}

#[tokio::test]
async fn stream_registers_subscriber_with_filter() {
    let state = test_state(true, true).await;
    let app = router(Arc::clone(&state));

    let response = app
        .oneshot(
            Request::get("/api/logs/stream?service=nginx")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/event-stream"));
    assert_eq!(state.hub.subscriber_count(), 1);
}
