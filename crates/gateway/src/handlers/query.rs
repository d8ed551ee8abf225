//! Query handlers
//!
//! Queries are answered over Server-Sent Events. The engine runs on its own
//! task and publishes to a per-request channel; the response stream ends
//! after the first `completed` event, or with a synthesized one if the run
//! goes away early.

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use quarry_common::{
    errors::{AppError, Result},
    models::StreamEvent,
};
use quarry_research::{EventBus, QueryRequest};

/// Query request
#[derive(Debug, Deserialize, Validate)]
pub struct QueryBody {
    #[validate(length(min = 1, max = 4000))]
    pub query: String,

    /// Continue an existing session
    pub session_id: Option<Uuid>,

    #[validate(length(min = 1, max = 128))]
    pub user_id: Option<String>,

    #[validate(length(min = 2, max = 16))]
    pub locale: Option<String>,
}

/// Validate a request body, naming the first offending field
pub fn validated<T: Validate>(body: T) -> Result<T> {
    body.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: e.field_errors().keys().next().map(|k| k.to_string()),
    })?;
    Ok(body)
}

/// SSE frame for one stream event
pub fn to_sse_event(event: &StreamEvent) -> Event {
    match Event::default().event(event.name()).json_data(event) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, event = event.name(), "Failed to encode stream event");
            Event::default().event("error").data("event encoding failed")
        }
    }
}

/// Frames from `key`'s channel until completion; the channel is released
/// when the client goes away
pub fn sse_frames(
    bus: &Arc<EventBus>,
    key: Uuid,
    session_id: Option<Uuid>,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> + Send + 'static {
    bus.follow(key, session_id).map(|event| Ok(to_sse_event(&event)))
}

/// Start the engine on `request` and stream its events
pub fn stream_query(
    state: &AppState,
    request: QueryRequest,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>> + Send + 'static> {
    let stream_id = Uuid::new_v4();
    let frames = sse_frames(&state.bus, stream_id, request.session_id);
    let emitter = state.bus.emitter(stream_id);
    let engine = state.engine.clone();

    tokio::spawn(async move {
        if let Err(e) = engine.handle(request, &emitter).await {
            tracing::debug!(stream_id = %stream_id, error = %e, "Query ended with an error");
        }
    });

    Sse::new(frames).keep_alive(KeepAlive::default())
}

/// Route and answer a query, streaming progress and tokens
pub async fn query(
    State(state): State<AppState>,
    Json(body): Json<QueryBody>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>> + Send + 'static>> {
    let body = validated(body)?;
    if body.query.trim().is_empty() {
        return Err(AppError::Unroutable {
            message: "query is empty".to_string(),
        });
    }

    let mut request = QueryRequest::new(body.query);
    request.session_id = body.session_id;
    if let Some(user_id) = body.user_id {
        request.user_id = user_id;
    }
    if let Some(locale) = body.locale {
        request.locale = locale;
    }

    tracing::info!(
        user_id = %request.user_id,
        session_id = ?request.session_id,
        "Query accepted"
    );
    Ok(stream_query(&state, request))
}
