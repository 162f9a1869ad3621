//! Suppression Rule Routes

use alert_model::{Labels, MatchCondition, SuppressionRule};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::{ApiError, AppState};

pub async fn list_rules(State(state): State<Arc<AppState>>) -> Json<Vec<SuppressionRule>> {
    let mut rules = state.suppressor.rules();
    rules.sort_by_key(|r| r.id);
    Json(rules)
}

#[derive(Debug, Deserialize)]
pub struct RuleRequest {
    pub name: String,
    pub matches: Labels,
    #[serde(default)]
    pub condition: MatchCondition,
    pub duration_secs: u64,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub reason: String,
}

pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RuleRequest>,
) -> Result<(StatusCode, Json<SuppressionRule>), ApiError> {
    if request.matches.is_empty() {
        return Err(ApiError::BadRequest("matches must not be empty".to_string()));
    }
    if request.duration_secs == 0 {
        return Err(ApiError::BadRequest("duration_secs must be positive".to_string()));
    }
    let mut rule = SuppressionRule::new(
        request.name,
        request.matches,
        request.condition,
        Duration::from_secs(request.duration_secs),
        Utc::now(),
    );
    rule.creator = request.creator;
    rule.reason = request.reason;

    let rule = state.suppressor.save_rule(rule)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.suppressor.delete_rule(id)?;
    Ok(StatusCode::NO_CONTENT)
}
