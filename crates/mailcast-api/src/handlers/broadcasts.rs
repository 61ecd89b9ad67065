//! Broadcast handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use mailcast_common::types::{BroadcastId, VariationId, WorkspaceId};
use mailcast_core::{BroadcastMetrics, WinnerDecision};
use mailcast_storage::models::{
    AudienceSettings, Broadcast, BroadcastStatus, CreateBroadcast, CreateVariation,
    ScheduleSettings, TestSettings, UpdateBroadcast,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Query parameters for listing broadcasts
#[derive(Debug, Deserialize)]
pub struct ListBroadcastsQuery {
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// Broadcast list response
#[derive(Debug, Serialize, Deserialize)]
pub struct BroadcastListResponse {
    pub data: Vec<BroadcastResponse>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Broadcast response
#[derive(Debug, Serialize, Deserialize)]
pub struct BroadcastResponse {
    #[serde(flatten)]
    pub broadcast: Broadcast,
    pub progress_percentage: f64,
}

impl From<Broadcast> for BroadcastResponse {
    fn from(broadcast: Broadcast) -> Self {
        Self {
            progress_percentage: broadcast.progress_percentage(),
            broadcast,
        }
    }
}

/// Request body for creating a broadcast
#[derive(Debug, Deserialize)]
pub struct CreateBroadcastRequest {
    pub name: String,
    pub audience: AudienceSettings,
    #[serde(default)]
    pub schedule: ScheduleSettings,
    #[serde(default)]
    pub test_settings: TestSettings,
    pub variations: Vec<CreateVariation>,
}

/// Request body for a single test send
#[derive(Debug, Deserialize)]
pub struct TestSendRequest {
    pub email: String,
    pub variation_id: Option<VariationId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TestSendResponse {
    pub message_id: String,
}

/// Request body for selecting a winner
#[derive(Debug, Default, Deserialize)]
pub struct SelectWinnerRequest {
    pub variation_id: Option<VariationId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SelectWinnerResponse {
    /// `selected`, `already_selected`, `not_due` or `not_testing`
    pub decision: String,
    pub variation_id: Option<VariationId>,
}

impl From<WinnerDecision> for SelectWinnerResponse {
    fn from(decision: WinnerDecision) -> Self {
        let (decision, variation_id) = match decision {
            WinnerDecision::Selected(id) => ("selected", Some(id)),
            WinnerDecision::AlreadySelected(id) => ("already_selected", Some(id)),
            WinnerDecision::NotDue { .. } => ("not_due", None),
            WinnerDecision::NotTesting => ("not_testing", None),
        };
        Self {
            decision: decision.to_string(),
            variation_id,
        }
    }
}

/// List broadcasts for a workspace
///
/// GET /api/v1/workspaces/:workspace_id/broadcasts
pub async fn list_broadcasts(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<WorkspaceId>,
    Query(query): Query<ListBroadcastsQuery>,
) -> ApiResult<Json<BroadcastListResponse>> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            s.parse::<BroadcastStatus>()
                .map_err(ApiError::bad_request)?,
        ),
        None => None,
    };
    let limit = query.limit.clamp(1, 200);
    let offset = query.offset.max(0);

    let (broadcasts, total) = state
        .manager
        .list(workspace_id, status, limit, offset)
        .await?;

    Ok(Json(BroadcastListResponse {
        data: broadcasts.into_iter().map(BroadcastResponse::from).collect(),
        total,
        limit,
        offset,
    }))
}

/// Create a draft broadcast
///
/// POST /api/v1/workspaces/:workspace_id/broadcasts
pub async fn create_broadcast(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<WorkspaceId>,
    Json(input): Json<CreateBroadcastRequest>,
) -> ApiResult<(StatusCode, Json<BroadcastResponse>)> {
    let broadcast = state
        .manager
        .create(CreateBroadcast {
            workspace_id,
            name: input.name,
            audience: input.audience,
            schedule: input.schedule,
            test_settings: input.test_settings,
            variations: input.variations,
        })
        .await?;

    info!(workspace_id = %workspace_id, broadcast_id = %broadcast.id, "Broadcast created via API");
    Ok((StatusCode::CREATED, Json(broadcast.into())))
}

/// GET /api/v1/workspaces/:workspace_id/broadcasts/:id
pub async fn get_broadcast(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, id)): Path<(WorkspaceId, BroadcastId)>,
) -> ApiResult<Json<BroadcastResponse>> {
    let broadcast = state.manager.get(workspace_id, id).await?;
    Ok(Json(broadcast.into()))
}

/// Edit a draft broadcast
///
/// PUT /api/v1/workspaces/:workspace_id/broadcasts/:id
pub async fn update_broadcast(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, id)): Path<(WorkspaceId, BroadcastId)>,
    Json(input): Json<UpdateBroadcast>,
) -> ApiResult<Json<BroadcastResponse>> {
    let broadcast = state.manager.update(workspace_id, id, input).await?;
    Ok(Json(broadcast.into()))
}

/// DELETE /api/v1/workspaces/:workspace_id/broadcasts/:id
pub async fn delete_broadcast(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, id)): Path<(WorkspaceId, BroadcastId)>,
) -> ApiResult<StatusCode> {
    state.manager.delete(workspace_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/workspaces/:workspace_id/broadcasts/:id/schedule
pub async fn schedule_broadcast(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, id)): Path<(WorkspaceId, BroadcastId)>,
) -> ApiResult<Json<BroadcastResponse>> {
    let broadcast = state.manager.schedule(workspace_id, id).await?;
    Ok(Json(broadcast.into()))
}

/// POST /api/v1/workspaces/:workspace_id/broadcasts/:id/pause
pub async fn pause_broadcast(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, id)): Path<(WorkspaceId, BroadcastId)>,
) -> ApiResult<Json<BroadcastResponse>> {
    let broadcast = state.manager.pause(workspace_id, id).await?;
    Ok(Json(broadcast.into()))
}

/// POST /api/v1/workspaces/:workspace_id/broadcasts/:id/resume
pub async fn resume_broadcast(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, id)): Path<(WorkspaceId, BroadcastId)>,
) -> ApiResult<Json<BroadcastResponse>> {
    let broadcast = state.manager.resume(workspace_id, id).await?;
    Ok(Json(broadcast.into()))
}

/// POST /api/v1/workspaces/:workspace_id/broadcasts/:id/cancel
pub async fn cancel_broadcast(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, id)): Path<(WorkspaceId, BroadcastId)>,
) -> ApiResult<Json<BroadcastResponse>> {
    let broadcast = state.manager.cancel(workspace_id, id).await?;
    Ok(Json(broadcast.into()))
}

/// Send one variation to a single address without touching campaign state
///
/// POST /api/v1/workspaces/:workspace_id/broadcasts/:id/test-send
pub async fn test_send(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, id)): Path<(WorkspaceId, BroadcastId)>,
    Json(input): Json<TestSendRequest>,
) -> ApiResult<Json<TestSendResponse>> {
    let message_id = state
        .manager
        .send_to_individual(workspace_id, id, input.variation_id, &input.email)
        .await?;
    Ok(Json(TestSendResponse { message_id }))
}

/// GET /api/v1/workspaces/:workspace_id/broadcasts/:id/metrics
pub async fn broadcast_metrics(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, id)): Path<(WorkspaceId, BroadcastId)>,
) -> ApiResult<Json<BroadcastMetrics>> {
    state.manager.get(workspace_id, id).await?;
    let metrics = state.aggregator.broadcast_metrics(id).await?;
    Ok(Json(metrics))
}

/// POST /api/v1/workspaces/:workspace_id/broadcasts/:id/select-winner
pub async fn select_winner(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, id)): Path<(WorkspaceId, BroadcastId)>,
    input: Option<Json<SelectWinnerRequest>>,
) -> ApiResult<Json<SelectWinnerResponse>> {
    let variation_id = input.and_then(|Json(body)| body.variation_id);
    let decision = state
        .manager
        .select_winner(workspace_id, id, variation_id)
        .await?;
    Ok(Json(decision.into()))
}

/// POST /api/v1/workspaces/:workspace_id/broadcasts/:id/send-winner
pub async fn send_winner(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, id)): Path<(WorkspaceId, BroadcastId)>,
) -> ApiResult<Json<BroadcastResponse>> {
    let broadcast = state.manager.send_winner(workspace_id, id).await?;
    Ok(Json(broadcast.into()))
}
