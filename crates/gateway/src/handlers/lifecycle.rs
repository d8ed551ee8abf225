//! Host lifecycle signal handler

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use quarry_common::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostSignal {
    /// The client app moved to the background
    Background,
    /// The client app is terminating; running research is cancelled too
    Terminate,
}

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub signal: HostSignal,
}

#[derive(Serialize)]
pub struct SignalResponse {
    pub completed: Vec<Uuid>,
    pub cancelled_runs: usize,
}

/// Complete every active session
pub async fn host_signal(
    State(state): State<AppState>,
    Json(body): Json<SignalRequest>,
) -> Result<Json<SignalResponse>> {
    let cancelled_runs = match body.signal {
        HostSignal::Terminate => state.engine.registry().cancel_all(),
        HostSignal::Background => 0,
    };
    let completed = state.engine.lifecycle().on_host_signal().await?;

    tracing::info!(
        signal = ?body.signal,
        completed = completed.len(),
        cancelled_runs,
        "Host signal handled"
    );
    Ok(Json(SignalResponse {
        completed,
        cancelled_runs,
    }))
}
