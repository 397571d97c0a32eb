//! Operator routes: dead letters, backlog, and manual re-drive.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use classbell_common::error::AppError;
use classbell_common::types::{BacklogSummary, Notification};

use crate::middleware::auth::OpsAuth;
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ops/notifications/dead", get(list_dead))
        .route("/ops/notifications/{id}/retry", post(retry_notification))
        .route("/ops/backlog", get(backlog))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

/// GET /ops/notifications/dead?limit=: DEAD notifications, newest first.
async fn list_dead(
    State(state): State<AppState>,
    _auth: OpsAuth,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }

    let dead = state.queries.dead_notifications(limit).await?;
    Ok(Json(dead))
}

/// GET /ops/backlog: unprocessed events and notifications per state.
async fn backlog(
    State(state): State<AppState>,
    _auth: OpsAuth,
) -> Result<Json<BacklogSummary>, AppError> {
    Ok(Json(state.queries.backlog_summary().await?))
}

/// POST /ops/notifications/{id}/retry: move a FAILED notification back to PENDING.
async fn retry_notification(
    State(state): State<AppState>,
    _auth: OpsAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, AppError> {
    let notification = state.dispatcher.retry_failed(id).await?;
    tracing::info!(notification_id = %id, "Operator re-drove notification");
    Ok(Json(notification))
}
