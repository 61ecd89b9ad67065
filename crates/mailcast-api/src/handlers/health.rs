//! Health check and metrics exposition handlers

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiResult;
use crate::state::AppState;

/// Basic health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Detailed health response with component checks
#[derive(Debug, Serialize, Deserialize)]
pub struct DetailedHealthResponse {
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
}

/// Individual component health status
#[derive(Debug, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// healthy, unhealthy or in_memory
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<DetailedHealthResponse> {
    let database = match &state.db_pool {
        None => ComponentHealth {
            status: "in_memory".to_string(),
            latency_ms: None,
            error: None,
        },
        Some(pool) => {
            let start = std::time::Instant::now();
            match pool.health_check().await {
                Ok(()) => ComponentHealth {
                    status: "healthy".to_string(),
                    latency_ms: Some(start.elapsed().as_millis() as u64),
                    error: None,
                },
                Err(e) => ComponentHealth {
                    status: "unhealthy".to_string(),
                    latency_ms: None,
                    error: Some(e.to_string()),
                },
            }
        }
    };

    let status = if database.status == "unhealthy" {
        "unhealthy"
    } else {
        "healthy"
    };

    Json(DetailedHealthResponse {
        status: status.to_string(),
        checks: HealthChecks { database },
    })
}

/// Liveness check (is the process running)
pub async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "alive".to_string(),
    })
}

/// Readiness check (can the stores be reached)
pub async fn readiness(State(state): State<Arc<AppState>>) -> Result<StatusCode, StatusCode> {
    if let Some(pool) = &state.db_pool {
        pool.health_check()
            .await
            .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    }

    Ok(StatusCode::OK)
}

/// Prometheus text exposition of the engine counters
///
/// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let body = state.metrics.render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
