//! Mailcast API - Console and webhook HTTP surface
//!
//! Broadcast management, delivery event queries, provider webhook
//! receivers, health checks and the Prometheus endpoint.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::{cors_layer, create_router};
pub use state::AppState;
