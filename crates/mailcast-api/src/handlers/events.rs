//! Delivery event feed

use axum::{
    extract::{Path, Query, State},
    Json,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use mailcast_common::types::{normalize_message_id, BroadcastId, Paginated, WorkspaceId};
use mailcast_storage::models::{DeliveryEvent, DeliveryEventFilter, DeliveryEventType};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const MAX_PAGE_SIZE: i64 = 500;

/// Query parameters for the delivery event feed
#[derive(Debug, Default, Deserialize)]
pub struct ListEventsQuery {
    pub event_type: Option<DeliveryEventType>,
    pub recipient_email: Option<String>,
    pub message_id: Option<String>,
    pub broadcast_id: Option<BroadcastId>,
    pub transactional_id: Option<String>,
    pub timestamp_from: Option<DateTime<Utc>>,
    pub timestamp_to: Option<DateTime<Utc>>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

pub(crate) fn encode_cursor(seq: i64) -> String {
    URL_SAFE_NO_PAD.encode(seq.to_string())
}

pub(crate) fn decode_cursor(cursor: &str) -> Result<i64, ApiError> {
    URL_SAFE_NO_PAD
        .decode(cursor)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ApiError::bad_request("invalid cursor"))
}

/// List normalized delivery events in ingestion order
///
/// GET /api/v1/workspaces/:workspace_id/delivery-events
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<WorkspaceId>,
    Query(query): Query<ListEventsQuery>,
) -> ApiResult<Json<Paginated<DeliveryEvent>>> {
    let after_seq = query.cursor.as_deref().map(decode_cursor).transpose()?;
    let limit = query.limit.unwrap_or(100).clamp(1, MAX_PAGE_SIZE);

    let filter = DeliveryEventFilter {
        workspace_id,
        event_type: query.event_type,
        recipient_email: query.recipient_email,
        message_id: query.message_id.as_deref().map(normalize_message_id),
        broadcast_id: query.broadcast_id,
        transactional_id: query.transactional_id,
        timestamp_from: query.timestamp_from,
        timestamp_to: query.timestamp_to,
    };

    let mut data = state.events.list(&filter, after_seq, limit + 1).await?;
    let has_more = data.len() as i64 > limit;
    data.truncate(limit as usize);
    let cursor = if has_more {
        data.last().map(|e| encode_cursor(e.seq))
    } else {
        None
    };

    Ok(Json(Paginated {
        data,
        cursor,
        has_more,
    }))
}
