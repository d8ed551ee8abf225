//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tokio::time::Instant;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub checks: ReadyChecks,
}

#[derive(Serialize)]
pub struct ReadyChecks {
    pub session_store: StoreCheck,
    /// Research runs currently holding a cancellation token
    pub running_sessions: usize,
    /// Active sessions waiting on their inactivity timer
    pub watched_sessions: usize,
}

#[derive(Serialize)]
pub struct StoreCheck {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Liveness probe
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: quarry_common::VERSION,
    })
}

/// Readiness probe; 503 when the session store is unreachable
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let started = Instant::now();
    let session_store = match state.engine.store().ping().await {
        Ok(()) => StoreCheck {
            status: "up",
            latency_ms: Some(started.elapsed().as_millis() as u64),
            error: None,
        },
        Err(e) => {
            tracing::warn!(error = %e, "Session store ping failed");
            StoreCheck {
                status: "down",
                latency_ms: None,
                error: Some(e.to_string()),
            }
        }
    };

    let (code, status) = match session_store.status {
        "up" => (StatusCode::OK, "ready"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "not_ready"),
    };
    let checks = ReadyChecks {
        session_store,
        running_sessions: state.engine.registry().running_count(),
        watched_sessions: state.engine.lifecycle().active_timers(),
    };
    (code, Json(ReadyResponse { status, checks }))
}
