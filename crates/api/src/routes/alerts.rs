//! Alert Routes

use alert_model::{Alert, AlertHistory, IncomingAlert, Severity, Status};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use storage::with_tx;

use crate::{ApiError, AppState};

/// Query parameters for the alert list
#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    /// Filter by status; open alerts when absent
    pub status: Option<Status>,
    /// Maximum number of records
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Response for the alert list
#[derive(Debug, Serialize, Deserialize)]
pub struct AlertList {
    pub data: Vec<Alert>,
    pub count: usize,
    pub unacknowledged_count: usize,
}

/// List alerts, most recent first
pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AlertQuery>,
) -> Result<Json<AlertList>, ApiError> {
    let statuses = match params.status {
        Some(status) => vec![status],
        None => vec![Status::Active, Status::Suppressed],
    };
    let mut alerts = with_tx(state.store.as_ref(), |tx| tx.alerts_by_status(&statuses))?;
    alerts.sort_by(|a, b| b.id.cmp(&a.id));
    alerts.truncate(params.limit);

    let unacknowledged_count = alerts
        .iter()
        .filter(|a| a.status == Status::Active && a.owner.is_none())
        .count();
    Ok(Json(AlertList {
        count: alerts.len(),
        unacknowledged_count,
        data: alerts,
    }))
}

pub async fn get_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Alert>, ApiError> {
    let alert = with_tx(state.store.as_ref(), |tx| tx.get_alert(id))?;
    Ok(Json(alert))
}

pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<AlertHistory>>, ApiError> {
    let history = with_tx(state.store.as_ref(), |tx| {
        tx.get_alert(id)?;
        tx.history(id)
    })?;
    Ok(Json(history))
}

/// Queue a normalized alert for the handler
pub async fn post_alert(
    State(state): State<Arc<AppState>>,
    Json(incoming): Json<IncomingAlert>,
) -> Result<StatusCode, ApiError> {
    if incoming.name.trim().is_empty() || incoming.entity.trim().is_empty() {
        return Err(ApiError::BadRequest("name and entity are required".to_string()));
    }
    state
        .ingest
        .send(incoming)
        .await
        .map_err(|_| ApiError::Unavailable("ingestion queue closed".to_string()))?;
    metrics::counter!("alertmgr_alerts_received_total").increment(1);
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct SuppressRequest {
    pub creator: String,
    #[serde(default)]
    pub reason: String,
    pub duration_secs: u64,
}

pub async fn suppress_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(request): Json<SuppressRequest>,
) -> Result<Json<Alert>, ApiError> {
    if request.duration_secs == 0 {
        return Err(ApiError::BadRequest("duration_secs must be positive".to_string()));
    }
    let event = state
        .handler
        .suppress(
            id,
            &request.creator,
            &request.reason,
            Duration::from_secs(request.duration_secs),
        )
        .await?;
    Ok(Json(event.alert))
}

pub async fn unsuppress_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Alert>, ApiError> {
    let event = state.handler.unsuppress(id).await?;
    Ok(Json(event.alert))
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub owner: String,
    pub team: Option<String>,
}

pub async fn ack_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(request): Json<AckRequest>,
) -> Result<Json<Alert>, ApiError> {
    let event = state
        .handler
        .set_owner(id, &request.owner, request.team.as_deref())
        .await?;
    Ok(Json(event.alert))
}

pub async fn clear_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Alert>, ApiError> {
    let events = state.handler.clear(id).await?;
    events
        .into_iter()
        .next()
        .map(|event| Json(event.alert))
        .ok_or_else(|| ApiError::Internal(format!("clear of alert {} produced no event", id)))
}

#[derive(Debug, Deserialize)]
pub struct EscalateRequest {
    pub severity: Severity,
}

pub async fn escalate_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(request): Json<EscalateRequest>,
) -> Result<Json<Alert>, ApiError> {
    let event = state.handler.escalate(id, request.severity).await?;
    Ok(Json(event.alert))
}
