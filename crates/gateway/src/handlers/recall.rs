//! Recall handlers

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::query::validated;
use crate::AppState;
use quarry_common::{errors::Result, models::Query};
use quarry_sessions::{RecallMatch, RecallOutcome};

/// Recall request
#[derive(Debug, Deserialize, Validate)]
pub struct RecallRequest {
    #[validate(length(min = 1, max = 2000))]
    pub query: String,

    /// Maximum matches to list
    #[validate(range(min = 1, max = 20))]
    pub limit: Option<usize>,

    #[validate(length(min = 1, max = 128))]
    pub user_id: Option<String>,
}

#[derive(Serialize)]
pub struct RecallResponse {
    pub matches: Vec<RecallMatch>,
    pub outcome: RecallOutcome,
}

/// Search completed sessions and resolve the query against them
pub async fn recall(
    State(state): State<AppState>,
    Json(body): Json<RecallRequest>,
) -> Result<Json<RecallResponse>> {
    let body = validated(body)?;
    let search = state.engine.recall_search();

    let limit = body.limit.unwrap_or(state.config.recall.default_limit);
    let matches = search.search(&body.query, limit).await?;

    let user_id = body.user_id.unwrap_or_else(|| "anonymous".to_string());
    let query = Query::new(body.query, "en", user_id);
    let outcome = search.recall(&query).await?;

    Ok(Json(RecallResponse { matches, outcome }))
}
