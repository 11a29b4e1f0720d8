//! HTTP surface: subscriber stream, filtered fetch, service inventory, and
//! health.
//!
//! Routes:
//! - `GET /api/logs/stream?service=<s>` — long-lived SSE stream of `record`,
//!   `enrichment`, and `heartbeat` events, with a 3 s retry hint.
//! - `GET /api/logs?limit=&service=&level=` — filtered read, newest first.
//! - `GET /api/services` — distinct services seen in the store.
//! - `GET /api/health` — overall status, version, per-dependency status,
//!   subscriber count, uptime, and processing statistics.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use opsentra_core::pipeline::HealthStatus;

use crate::error::AggregatorError;
use crate::hub::{StreamEvent, SubscriberHub};
use crate::store::{FetchFilter, LogStore};

/// Default fetch limit.
const DEFAULT_FETCH_LIMIT: i64 = 100;
/// Maximum fetch limit.
const MAX_FETCH_LIMIT: i64 = 1_000;
/// Reconnect hint advertised to stream clients.
const RETRY_HINT: Duration = Duration::from_secs(3);

/// Processing counters surfaced through the health endpoint.
#[derive(Clone)]
pub struct ApiStats {
    /// Records persisted by the consumer.
    pub persisted: Arc<AtomicU64>,
    /// Enrichment updates applied.
    pub enriched: Arc<AtomicU64>,
    /// Messages dead-lettered.
    pub dead_lettered: Arc<AtomicU64>,
    /// Records archived to the object store.
    pub archived: Arc<AtomicU64>,
}

/// Shared state for all handlers.
pub struct ApiState {
    /// Subscriber hub.
    pub hub: Arc<SubscriberHub>,
    /// Time-series store handle.
    pub store: Arc<LogStore>,
    /// Broker connectivity flag (owned by the consumer).
    pub broker_connected: Arc<AtomicBool>,
    /// Object store health flag (owned by the archival scheduler).
    pub object_store_ok: Arc<AtomicBool>,
    /// Processing statistics.
    pub stats: ApiStats,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
    /// When true, new subscriber registrations are refused (shutdown).
    pub accepting_subscribers: Arc<AtomicBool>,
}

/// Build the router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/logs/stream", get(stream_logs))
        .route("/api/logs", get(fetch_logs))
        .route("/api/services", get(list_services))
        .route("/api/health", get(health))
        .with_state(state)
}

/// Query parameters for the subscriber stream.
#[derive(Debug, Deserialize)]
struct StreamQuery {
    /// Optional service filter.
    service: Option<String>,
}

/// Query parameters for the filtered fetch.
#[derive(Debug, Deserialize)]
struct FetchQuery {
    limit: Option<i64>,
    service: Option<String>,
    level: Option<String>,
}

/// Filtered fetch response body.
#[derive(Debug, Serialize)]
struct FetchResponse {
    logs: Vec<serde_json::Value>,
    count: usize,
}

/// Service inventory response body.
#[derive(Debug, Serialize)]
struct ServicesResponse {
    services: Vec<String>,
}

/// Per-dependency health in the health response.
#[derive(Debug, Serialize)]
struct DependencyHealth {
    broker: String,
    store: String,
    object_store: String,
}

/// Health response body.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: HealthStatus,
    version: &'static str,
    uptime_secs: u64,
    dependencies: DependencyHealth,
    subscribers: usize,
    stats: StatsBody,
}

#[derive(Debug, Serialize)]
struct StatsBody {
    records_persisted: u64,
    enrichments_applied: u64,
    dead_lettered: u64,
    records_archived: u64,
    subscriber_overflow_disconnects: u64,
}

/// Error wrapper so store failures map to 5xx responses.
struct ApiError(AggregatorError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.0.to_string() });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

impl From<AggregatorError> for ApiError {
    fn from(err: AggregatorError) -> Self {
        Self(err)
    }
}

/// Handle `GET /api/logs/stream`.
///
/// Registers a subscriber with the hub and frames its events as SSE.
/// Client disconnects surface as closed sinks and the hub prunes them on the
/// next delivery.
async fn stream_logs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    if !state.accepting_subscribers.load(Ordering::Relaxed) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let filter = query.service.filter(|s| !s.is_empty());
    let (id, rx) = state.hub.register(filter);
    debug!(subscriber = %id, "stream subscriber connected");

    let events = ReceiverStream::new(rx).map(|event| Ok(frame_event(event)));
    let hello = futures::stream::once(async {
        Ok::<_, Infallible>(Event::default().retry(RETRY_HINT).comment("connected"))
    });

    Ok(Sse::new(hello.chain(events)).keep_alive(KeepAlive::new().interval(RETRY_HINT)))
}

/// Convert a hub event into an SSE frame.
fn frame_event(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Record { id, record } => {
            let mut body = serde_json::to_value(&record)
                .unwrap_or_else(|_| serde_json::json!({ "message": record.message }));
            if let Some(map) = body.as_object_mut() {
                map.insert("id".to_owned(), serde_json::Value::String(id));
            }
            Event::default().event("record").data(body.to_string())
        }
        StreamEvent::Enrichment(update) => {
            let body = serde_json::to_value(&update).unwrap_or_default();
            Event::default().event("enrichment").data(body.to_string())
        }
        StreamEvent::Heartbeat => Event::default().event("heartbeat").data(""),
    }
}

/// Handle `GET /api/logs`.
async fn fetch_logs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<FetchQuery>,
) -> Result<Json<FetchResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_FETCH_LIMIT)
        .clamp(1, MAX_FETCH_LIMIT);
    let filter = FetchFilter {
        service: query.service.filter(|s| !s.is_empty()),
        level: query.level.filter(|s| !s.is_empty()),
        limit,
    };

    let logs = state.store.fetch_filtered(&filter).await?;
    let count = logs.len();
    Ok(Json(FetchResponse { logs, count }))
}

/// Handle `GET /api/services`.
async fn list_services(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<ServicesResponse>, ApiError> {
    let services = state.store.list_services().await?;
    Ok(Json(ServicesResponse { services }))
}

/// Handle `GET /api/health`.
async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let broker_up = state.broker_connected.load(Ordering::Relaxed);
    let store_up = state.store.ping().await;
    let object_store_up = state.object_store_ok.load(Ordering::Relaxed);

    let status = if broker_up && store_up && object_store_up {
        HealthStatus::Healthy
    } else if store_up {
        HealthStatus::Degraded(dependency_summary(broker_up, store_up, object_store_up))
    } else {
        HealthStatus::Unhealthy(dependency_summary(broker_up, store_up, object_store_up))
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        dependencies: DependencyHealth {
            broker: up_or_down(broker_up),
            store: up_or_down(store_up),
            object_store: up_or_down(object_store_up),
        },
        subscribers: state.hub.subscriber_count(),
        stats: StatsBody {
            records_persisted: state.stats.persisted.load(Ordering::Relaxed),
            enrichments_applied: state.stats.enriched.load(Ordering::Relaxed),
            dead_lettered: state.stats.dead_lettered.load(Ordering::Relaxed),
            records_archived: state.stats.archived.load(Ordering::Relaxed),
            subscriber_overflow_disconnects: state.hub.overflow_disconnects(),
        },
    })
}

fn up_or_down(up: bool) -> String {
    if up { "up".to_owned() } else { "down".to_owned() }
}

fn dependency_summary(broker: bool, store: bool, object_store: bool) -> String {
    let mut down = Vec::new();
    if !broker {
        down.push("broker");
    }
    if !store {
        down.push("store");
    }
    if !object_store {
        down.push("object-store");
    }
    format!("unavailable: {}", down.join(", "))
}
