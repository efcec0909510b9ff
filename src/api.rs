//! Log Streaming API Endpoints
//!
//! Provides the HTTP surface of the subsystem:
//! - Live SSE log tailing (dashboard clients)
//! - Health check (connection counts for the dashboard aggregation)

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::registry::ConnectionRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::store::LogStore;
use crate::stream::StreamSession;
use axum::{
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

// ============================================================================
// SHARED STATE
// ============================================================================

/// API state shared across all handlers
pub struct ApiState {
    pub store: Arc<LogStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub coordinator: Arc<ShutdownCoordinator>,
    pub config: StreamConfig,
}

// ============================================================================
// HEALTH ENDPOINT
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub connections: ConnectionCounts,
    pub active_streams: usize,
}

#[derive(Debug, Serialize)]
pub struct ConnectionCounts {
    pub total: usize,
    pub sessions: usize,
    pub limit: usize,
}

/// GET /health - Health check with live connection counts
pub async fn health_check(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let snapshot = state.registry.snapshot();
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: ConnectionCounts {
            total: snapshot.total,
            sessions: snapshot.sessions,
            limit: snapshot.limit,
        },
        active_streams: state.coordinator.active_streams(),
    })
}

// ============================================================================
// STREAMING ENDPOINT
// ============================================================================

/// GET /api/v1/sessions/:session_id/logs/stream - Live SSE log tail
///
/// Replays the session's backlog, then streams appended entries until the
/// session ends or a termination trigger fires. Rejected with 503 when the
/// global connection cap is reached; clients retry rather than queue.
pub async fn stream_session_logs(
    State(state): State<Arc<ApiState>>,
    Path(session_id): Path<String>,
) -> Response {
    let handle = match StreamSession::open(
        Arc::clone(&state.store),
        Arc::clone(&state.registry),
        Arc::clone(&state.coordinator),
        state.config.clone(),
        &session_id,
    )
    .await
    {
        Ok(handle) => handle,
        Err(StreamError::AdmissionDenied { limit }) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Too many concurrent log streams (limit {limit}). Retry shortly."),
            )
                .into_response();
        }
        Err(err) => {
            warn!(session_id, %err, "failed to open log stream");
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    };

    let events = handle
        .frames
        .map(|frame| Event::default().json_data(&frame));

    let sse = Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(state.config.session.heartbeat_interval())
            .text("keepalive"),
    );

    // Proxies must not buffer or cache the event stream
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
        .into_response()
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/v1/sessions/:session_id/logs/stream",
            get(stream_session_logs),
        )
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullMetrics;
    use tempfile::tempdir;

    fn state_with_limit(limit: usize) -> (Arc<ApiState>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let state = Arc::new(ApiState {
            store: Arc::new(LogStore::new(dir.path()).unwrap()),
            registry: Arc::new(ConnectionRegistry::new(limit, Arc::new(NullMetrics))),
            coordinator: Arc::new(ShutdownCoordinator::new()),
            config: StreamConfig::default(),
        });
        (state, dir)
    }

    #[tokio::test]
    async fn test_stream_response_headers() {
        let (state, _dir) = state_with_limit(10);

        let response =
            stream_session_logs(State(Arc::clone(&state)), Path("s1".to_string())).await;

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get("cache-control").unwrap(), "no-cache");
        assert_eq!(headers.get("x-accel-buffering").unwrap(), "no");
        assert!(headers
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));
    }

    #[tokio::test]
    async fn test_cap_reached_returns_503() {
        let (state, _dir) = state_with_limit(1);

        let held =
            stream_session_logs(State(Arc::clone(&state)), Path("s1".to_string())).await;
        assert_eq!(held.status(), StatusCode::OK);

        let denied =
            stream_session_logs(State(Arc::clone(&state)), Path("s2".to_string())).await;
        assert_eq!(denied.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.registry.total(), 1);
    }

    #[tokio::test]
    async fn test_health_reports_connection_counts() {
        let (state, _dir) = state_with_limit(10);

        let _held =
            stream_session_logs(State(Arc::clone(&state)), Path("s1".to_string())).await;

        let Json(health) = health_check(State(Arc::clone(&state))).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.connections.total, 1);
        assert_eq!(health.connections.limit, 10);
        assert_eq!(health.active_streams, 1);
    }
}
