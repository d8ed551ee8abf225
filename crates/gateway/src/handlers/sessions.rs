//! Session management handlers

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use uuid::Uuid;
use validator::Validate;

use super::query::{sse_frames, stream_query, validated};
use crate::AppState;
use quarry_common::{
    errors::Result,
    models::{CompletionTrigger, ResearchSession},
};
use quarry_research::QueryRequest;

/// Follow-up message request
#[derive(Debug, Deserialize, Validate)]
pub struct MessageRequest {
    #[validate(length(min = 1, max = 4000))]
    pub message: String,

    #[validate(length(min = 1, max = 128))]
    pub user_id: Option<String>,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub session_id: Uuid,
    /// False when no run was in progress
    pub cancelled: bool,
}

/// Get a session with its rounds and conversation
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ResearchSession>> {
    let session = state.engine.store().get(session_id).await?;
    Ok(Json(session))
}

/// Subscribe to a session's events until its current run completes
pub async fn session_events(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>> + Send + 'static>> {
    state.engine.store().get(session_id).await?;
    let frames = sse_frames(&state.bus, session_id, Some(session_id));

    tracing::debug!(session_id = %session_id, "Session subscriber attached");
    Ok(Sse::new(frames).keep_alive(KeepAlive::default()))
}

/// Send a follow-up message to a session
pub async fn post_message(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(body): Json<MessageRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>> + Send + 'static>> {
    let body = validated(body)?;
    state.engine.store().get(session_id).await?;

    let mut request = QueryRequest::new(body.message).in_session(session_id);
    if let Some(user_id) = body.user_id {
        request.user_id = user_id;
    }
    Ok(stream_query(&state, request))
}

/// Explicitly complete a session, stopping any running research first
pub async fn complete_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ResearchSession>> {
    state.engine.registry().cancel(session_id);

    let completed = state
        .engine
        .lifecycle()
        .complete(session_id, CompletionTrigger::Explicit)
        .await?;
    let session = match completed {
        Some(session) => session,
        None => state.engine.store().get(session_id).await?,
    };

    tracing::info!(session_id = %session_id, "Session completed on request");
    Ok(Json(session))
}

/// Cancel the session's running research, if any
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<CancelResponse>> {
    state.engine.store().get(session_id).await?;
    let cancelled = state.engine.registry().cancel(session_id);

    tracing::info!(session_id = %session_id, cancelled, "Cancel requested");
    Ok(Json(CancelResponse {
        session_id,
        cancelled,
    }))
}
