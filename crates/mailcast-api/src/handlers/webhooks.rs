//! Provider webhook receivers

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Json,
};
use mailcast_common::types::{IntegrationId, WorkspaceId};
use mailcast_common::{Error, Result};
use mailcast_core::IngestOutcome;
use mailcast_storage::models::EmailProvider;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::error::ApiResult;
use crate::state::AppState;

/// Query parameters identifying the receiving workspace
#[derive(Debug)]
pub struct WebhookQuery {
    pub workspace_id: WorkspaceId,
    pub integration_id: Option<IntegrationId>,
}

impl WebhookQuery {
    fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let workspace_id = params
            .get("workspace_id")
            .ok_or_else(|| Error::Validation("workspace_id is required".to_string()))?
            .parse()
            .map_err(|_| Error::Validation("workspace_id is not a valid UUID".to_string()))?;
        let integration_id = params
            .get("integration_id")
            .filter(|v| !v.is_empty())
            .map(|v| v.parse())
            .transpose()
            .map_err(|_| Error::Validation("integration_id is not a valid UUID".to_string()))?;

        Ok(Self {
            workspace_id,
            integration_id,
        })
    }
}

/// Acknowledgement returned to the provider
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WebhookAck {
    pub recorded: usize,
    pub duplicates: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookAck {
    fn rejected(error: &Error) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

/// Receive a provider webhook
///
/// Providers retry on non-2xx responses, so anything but a failed signature
/// check is acknowledged with 200. The body is taken raw so that bad JSON or
/// a missing workspace never turns into an extractor rejection.
///
/// POST /webhooks/:provider
pub async fn receive(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    params: Option<Query<HashMap<String, String>>>,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let params = params.map(|Query(p)| p).unwrap_or_default();

    match ingest(&state, &provider, &params, &body).await {
        Ok(ack) => Ok(Json(ack)),
        Err(e @ Error::Signature(_)) => Err(e.into()),
        Err(e) => {
            warn!(
                provider = %provider,
                workspace_id = params.get("workspace_id").map(String::as_str).unwrap_or("-"),
                error = %e,
                "Webhook payload not ingested"
            );
            Ok(Json(WebhookAck::rejected(&e)))
        }
    }
}

async fn ingest(
    state: &AppState,
    provider: &str,
    params: &HashMap<String, String>,
    body: &[u8],
) -> Result<WebhookAck> {
    let provider: EmailProvider = provider.parse().map_err(Error::Validation)?;
    let query = WebhookQuery::from_params(params)?;
    let body: Value = serde_json::from_slice(body)
        .map_err(|e| Error::MalformedPayload(format!("{} body is not JSON: {}", provider, e)))?;

    let outcomes = state
        .normalizer
        .ingest(query.workspace_id, provider, query.integration_id, &body)
        .await?;

    let mut ack = WebhookAck::default();
    for outcome in &outcomes {
        match outcome {
            IngestOutcome::Recorded(_) => ack.recorded += 1,
            IngestOutcome::Duplicate { .. } => ack.duplicates += 1,
        }
    }
    Ok(ack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_query_requires_workspace() {
        let err = WebhookQuery::from_params(&params(&[])).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = WebhookQuery::from_params(&params(&[("workspace_id", "nope")])).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_query_parses_optional_integration() {
        let ws = uuid::Uuid::new_v4();
        let query = WebhookQuery::from_params(&params(&[
            ("workspace_id", &ws.to_string()),
            ("integration_id", ""),
        ]))
        .unwrap();
        assert_eq!(query.workspace_id, ws);
        assert_eq!(query.integration_id, None);
    }
}
