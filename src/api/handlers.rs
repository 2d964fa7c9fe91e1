use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::jwt::TokenPair;
use crate::errors::AppError;
use crate::jobs::QueueHealth;
use crate::middleware::auth::{CurrentUser, MaybeUser};
use crate::models::job::QueueStats;
use crate::models::user::Principal;

use super::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: String,
}

#[derive(Serialize)]
pub struct UserResponse {
    pub user: Principal,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub authenticated: bool,
    pub user: Option<Principal>,
}

#[derive(Serialize)]
pub struct QueueListResponse {
    pub queues: Vec<QueueStats>,
}

// ── Handlers ─────────────────────────────────────────────────

pub async fn liveness() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, AppError> {
    let pair = state.auth.refresh(&req.refresh_token).await?;
    Ok(Json(pair))
}

pub async fn me(CurrentUser(user): CurrentUser) -> Json<UserResponse> {
    Json(UserResponse { user })
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> Json<Value> {
    state.auth.logout(&user);
    Json(json!({ "message": "logged out" }))
}

pub async fn session(MaybeUser(user): MaybeUser) -> Json<SessionResponse> {
    Json(SessionResponse {
        authenticated: user.is_some(),
        user,
    })
}

pub async fn list_queues(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueueListResponse>, AppError> {
    let queues = state.queues.get_all_queue_stats().await?;
    Ok(Json(QueueListResponse { queues }))
}

pub async fn queue_stats(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<QueueStats>, AppError> {
    Ok(Json(state.queues.get_queue_stats(&name).await?))
}

pub async fn pause_queue(
    State(state): State<Arc<AppState>>,
    CurrentUser(admin): CurrentUser,
    Path(name): Path<String>,
) -> Result<Json<QueueStats>, AppError> {
    state.queues.pause_queue(&name).await?;
    tracing::info!(queue = %name, admin_id = %admin.id, "queue paused via admin API");
    Ok(Json(state.queues.get_queue_stats(&name).await?))
}

pub async fn resume_queue(
    State(state): State<Arc<AppState>>,
    CurrentUser(admin): CurrentUser,
    Path(name): Path<String>,
) -> Result<Json<QueueStats>, AppError> {
    state.queues.resume_queue(&name).await?;
    tracing::info!(queue = %name, admin_id = %admin.id, "queue resumed via admin API");
    Ok(Json(state.queues.get_queue_stats(&name).await?))
}

pub async fn queue_health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueueHealth>, AppError> {
    Ok(Json(state.queues.health().await?))
}
